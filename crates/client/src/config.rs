use std::str::FromStr;
use std::time::Duration;

use crate::reconnect::Backoff;

/// Per-connection configuration.
///
/// All fields have defaults; override individual fields with struct update
/// syntax or load them from the environment with [`ConnectionOptions::from_env`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOptions {
    /// Sub-protocols offered during the handshake.
    pub protocols: Vec<String>,
    /// Base delay between reconnection attempts (default: 3000ms).
    pub reconnect_interval: Duration,
    /// Reconnection attempts after an unclean loss (default: 5).
    pub max_reconnect_attempts: u32,
    /// Time between pings; zero disables the heartbeat (default: 30000ms).
    pub heartbeat_interval: Duration,
    /// How long to wait for a pong (default: 5000ms).
    pub heartbeat_timeout: Duration,
    /// Timeout used by [`Connection::request`](crate::Connection::request)
    /// (default: 10000ms).
    pub ack_timeout: Duration,
    /// Delay growth between reconnection attempts (default: fixed).
    pub backoff: Backoff,
    /// Fail outstanding acks on `disconnect()` instead of letting them
    /// time out (default: false).
    pub fail_pending_on_disconnect: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            protocols: Vec::new(),
            reconnect_interval: Duration::from_millis(3000),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_millis(30_000),
            heartbeat_timeout: Duration::from_millis(5000),
            ack_timeout: Duration::from_millis(10_000),
            backoff: Backoff::Fixed,
            fail_pending_on_disconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("Missing required variable {0}")]
    Missing(String),
}

impl ConnectionOptions {
    /// Load options from environment variables, falling back to defaults.
    ///
    /// | Env Var                             | Default  |
    /// |-------------------------------------|----------|
    /// | `TETHER_PROTOCOLS`                  | (none)   |
    /// | `TETHER_RECONNECT_INTERVAL_MS`      | `3000`   |
    /// | `TETHER_MAX_RECONNECT_ATTEMPTS`     | `5`      |
    /// | `TETHER_HEARTBEAT_INTERVAL_MS`      | `30000`  |
    /// | `TETHER_HEARTBEAT_TIMEOUT_MS`       | `5000`   |
    /// | `TETHER_ACK_TIMEOUT_MS`             | `10000`  |
    /// | `TETHER_BACKOFF`                    | `fixed`  |
    /// | `TETHER_BACKOFF_MAX_MS`             | `30000`  |
    /// | `TETHER_FAIL_PENDING_ON_DISCONNECT` | `false`  |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let protocols = lookup("TETHER_PROTOCOLS")
            .map(|raw| split_list(&raw))
            .unwrap_or_default();

        let reconnect_interval = millis(&lookup, "TETHER_RECONNECT_INTERVAL_MS")?
            .unwrap_or(defaults.reconnect_interval);
        let max_reconnect_attempts = parse(&lookup, "TETHER_MAX_RECONNECT_ATTEMPTS")?
            .unwrap_or(defaults.max_reconnect_attempts);
        let heartbeat_interval = millis(&lookup, "TETHER_HEARTBEAT_INTERVAL_MS")?
            .unwrap_or(defaults.heartbeat_interval);
        let heartbeat_timeout = millis(&lookup, "TETHER_HEARTBEAT_TIMEOUT_MS")?
            .unwrap_or(defaults.heartbeat_timeout);
        let ack_timeout =
            millis(&lookup, "TETHER_ACK_TIMEOUT_MS")?.unwrap_or(defaults.ack_timeout);

        let backoff = match lookup("TETHER_BACKOFF").as_deref().map(str::trim) {
            None | Some("") | Some("fixed") => Backoff::Fixed,
            Some("exponential") => {
                let max_delay = millis(&lookup, "TETHER_BACKOFF_MAX_MS")?
                    .unwrap_or(Duration::from_secs(30));
                Backoff::Exponential {
                    multiplier: 2.0,
                    max_delay,
                }
            }
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "TETHER_BACKOFF".into(),
                    value: other.into(),
                })
            }
        };

        let fail_pending_on_disconnect = parse(&lookup, "TETHER_FAIL_PENDING_ON_DISCONNECT")?
            .unwrap_or(defaults.fail_pending_on_disconnect);

        Ok(Self {
            protocols,
            reconnect_interval,
            max_reconnect_attempts,
            heartbeat_interval,
            heartbeat_timeout,
            ack_timeout,
            backoff,
            fail_pending_on_disconnect,
        })
    }
}

/// Split a comma-separated list, dropping blanks.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}
