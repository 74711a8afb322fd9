// Wire messages for the collaboration relay.
//
// Clients send arbitrary JSON objects. The relay adds a server `timestamp` and
// forwards them untouched otherwise; the only frame it originates is `sys`.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Field the relay sets on every forwarded payload.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Confirmation text sent to a connection right after it joins a room.
pub const DEFAULT_CONNECTED_MESSAGE: &str = "Connected to collaboration session";

/// Frames originated by the relay itself (never relayed between clients).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Server -> Client: point-to-point system notice.
    Sys { message: String },
}

impl ServerMessage {
    pub fn connected(message: impl Into<String>) -> Self {
        Self::Sys { message: message.into() }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid UTF-8")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("payload must be a JSON object, got {0}")]
    NotAnObject(&'static str),
}

/// A client payload on its way through the relay.
///
/// Keys keep their insertion order so the forwarded document reads the same
/// as the one the sender produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayPayload {
    fields: Map<String, Value>,
}

impl RelayPayload {
    pub fn parse(raw: &str) -> Result<Self, PayloadError> {
        match serde_json::from_str::<Value>(raw)? {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(PayloadError::NotAnObject(json_kind(&other))),
        }
    }

    pub fn parse_bytes(raw: &[u8]) -> Result<Self, PayloadError> {
        Self::parse(std::str::from_utf8(raw)?)
    }

    /// Set `timestamp` to `at`, replacing any client-supplied value in place.
    pub fn stamp(mut self, at: DateTime<Utc>) -> Self {
        self.fields.insert(TIMESTAMP_FIELD.to_owned(), Value::String(format_timestamp(at)));
        self
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    pub fn into_fields(self) -> Map<String, Value> {
        self.fields
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.fields)
    }
}

/// ISO-8601 UTC with millisecond precision, e.g. `2026-10-18T09:30:00.123Z`.
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
