// Session tokens and the `/collaboration/<token>` admission path.

use std::{borrow::Borrow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Path prefix every collaboration upgrade request must carry.
pub const COLLABORATION_PATH_PREFIX: &str = "/collaboration/";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("session token is empty")]
    Empty,

    #[error("session token must be a single path segment")]
    MultipleSegments,

    #[error("path is not a collaboration path: {0}")]
    NotCollaborationPath(String),
}

/// Opaque identifier grouping connections into one collaboration room.
///
/// The relay never interprets the value. Two tokens name the same room iff
/// their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionToken(String);

impl SessionToken {
    /// Accept one non-empty path segment as a token, verbatim.
    pub fn from_segment(segment: &str) -> Result<Self, TokenError> {
        if segment.is_empty() {
            return Err(TokenError::Empty);
        }
        if segment.contains('/') {
            return Err(TokenError::MultipleSegments);
        }

        Ok(Self(segment.to_owned()))
    }

    /// Extract the token from a raw request path of the form
    /// `/collaboration/<token>`.
    ///
    /// The segment is not percent-decoded: `/collaboration/a%20b` yields the
    /// token `a%20b`. Trailing slashes and nested segments are rejected.
    pub fn from_collaboration_path(path: &str) -> Result<Self, TokenError> {
        let segment = path
            .strip_prefix(COLLABORATION_PATH_PREFIX)
            .ok_or_else(|| TokenError::NotCollaborationPath(path.to_owned()))?;

        Self::from_segment(segment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    /// The admission path for this token.
    pub fn collaboration_path(&self) -> String {
        format!("{COLLABORATION_PATH_PREFIX}{}", self.0)
    }
}

impl FromStr for SessionToken {
    type Err = TokenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_segment(value)
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionToken {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for SessionToken {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_token_from_collaboration_path() {
        let token = SessionToken::from_collaboration_path("/collaboration/sess-42")
            .expect("path should be admitted");
        assert_eq!(token.as_str(), "sess-42");
    }

    #[test]
    fn token_is_taken_verbatim_without_decoding() {
        let token = SessionToken::from_collaboration_path("/collaboration/SESS_A%2FB")
            .expect("encoded segment should be admitted");
        assert_eq!(token.as_str(), "SESS_A%2FB");
    }

    #[test]
    fn rejects_empty_token() {
        assert_eq!(SessionToken::from_collaboration_path("/collaboration/"), Err(TokenError::Empty));
    }

    #[test]
    fn rejects_nested_segments_and_trailing_slash() {
        assert_eq!(
            SessionToken::from_collaboration_path("/collaboration/a/b"),
            Err(TokenError::MultipleSegments)
        );
        assert_eq!(
            SessionToken::from_collaboration_path("/collaboration/a/"),
            Err(TokenError::MultipleSegments)
        );
    }

    #[test]
    fn rejects_other_paths() {
        for path in ["/", "/collaboration", "/api/collaboration/abc", "/Collaboration/abc", ""] {
            assert!(
                matches!(
                    SessionToken::from_collaboration_path(path),
                    Err(TokenError::NotCollaborationPath(_))
                ),
                "`{path}` must not be admitted",
            );
        }
    }

    #[test]
    fn collaboration_path_round_trips() {
        let token: SessionToken = "other".parse().expect("segment should parse");
        assert_eq!(token.collaboration_path(), "/collaboration/other");
        assert_eq!(
            SessionToken::from_collaboration_path(&token.collaboration_path()),
            Ok(token)
        );
    }

    #[test]
    fn serializes_as_bare_string() {
        let token = SessionToken::from_segment("tok1").expect("segment should parse");
        assert_eq!(serde_json::to_string(&token).expect("token should serialize"), "\"tok1\"");
    }
}
