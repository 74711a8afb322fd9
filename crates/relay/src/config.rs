// Relay server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development.

use std::net::SocketAddr;

use collab_common::protocol::collab::DEFAULT_CONNECTED_MESSAGE;

pub(crate) const DEFAULT_PORT: u16 = 8080;
pub(crate) const DEFAULT_OUTBOUND_QUEUE_CAPACITY: usize = 256;
pub(crate) const DEFAULT_MAX_MESSAGE_BYTES: usize = 262_144;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Core relay server configuration.
///
/// Constructed via [`RelayConfig::from_env`] which reads environment
/// variables and falls back to development defaults.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// Log filter directive (e.g. `info`, `collab_relay=debug`).
    pub log_filter: String,
    pub log_format: LogFormat,
    /// Comma-separated CORS origins (or `"*"` for any).
    pub cors_origins: Option<String>,
    pub relay: RelaySettings,
}

/// Per-connection knobs handed to the WebSocket layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelaySettings {
    /// Frames buffered per recipient before new ones are skipped.
    pub outbound_queue_capacity: usize,
    /// Largest inbound message the transport accepts.
    pub max_message_bytes: usize,
    /// Text of the `sys` frame sent on join.
    pub connected_message: String,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            outbound_queue_capacity: DEFAULT_OUTBOUND_QUEUE_CAPACITY,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            connected_message: DEFAULT_CONNECTED_MESSAGE.to_string(),
        }
    }
}

impl RelayConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `COLLAB_RELAY_HOST` | `0.0.0.0` |
    /// | `COLLAB_RELAY_PORT` | `8080` |
    /// | `COLLAB_RELAY_LOG_FILTER` | `info` |
    /// | `COLLAB_RELAY_LOG_FORMAT` | `text` |
    /// | `COLLAB_RELAY_CORS_ORIGINS` | *(none; cors.rs uses dev defaults)* |
    /// | `COLLAB_RELAY_OUTBOUND_QUEUE_CAPACITY` | `256` |
    /// | `COLLAB_RELAY_MAX_MESSAGE_BYTES` | `262144` |
    /// | `COLLAB_RELAY_CONNECTED_MESSAGE` | `Connected to collaboration session` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    pub(crate) fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("COLLAB_RELAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("COLLAB_RELAY_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_PORT);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let log_filter = env("COLLAB_RELAY_LOG_FILTER").unwrap_or_else(|_| "info".into());
        let log_format = match env("COLLAB_RELAY_LOG_FORMAT").as_deref().map(str::trim) {
            Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        let cors_origins = env("COLLAB_RELAY_CORS_ORIGINS").ok();

        let outbound_queue_capacity =
            positive_usize(&env, "COLLAB_RELAY_OUTBOUND_QUEUE_CAPACITY")
                .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAPACITY);
        let max_message_bytes = positive_usize(&env, "COLLAB_RELAY_MAX_MESSAGE_BYTES")
            .unwrap_or(DEFAULT_MAX_MESSAGE_BYTES);
        let connected_message = env("COLLAB_RELAY_CONNECTED_MESSAGE")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTED_MESSAGE.into());

        Self {
            listen_addr,
            log_filter,
            log_format,
            cors_origins,
            relay: RelaySettings { outbound_queue_capacity, max_message_bytes, connected_message },
        }
    }
}

fn positive_usize<F>(env: &F, key: &str) -> Option<usize>
where
    F: Fn(&str) -> Result<String, std::env::VarError>,
{
    env(key).ok().and_then(|v| v.trim().parse::<usize>().ok()).filter(|v| *v > 0)
}
