use std::time::Duration;

use tether_client::config::split_list;
use tether_client::{ConfigError, ConnectionOptions};

/// One named endpoint from `TETHER_ENDPOINTS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

/// A room the agent joins once `connection` is up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomBinding {
    pub connection: String,
    pub room: String,
}

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub endpoints: Vec<Endpoint>,
    pub rooms: Vec<RoomBinding>,
    pub auth_token: Option<String>,
    /// `None` disables the scheduled token refresh.
    pub token_refresh: Option<Duration>,
    pub connection: ConnectionOptions,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    ///
    /// | Env Var                     | Required | Description                         |
    /// |-----------------------------|----------|-------------------------------------|
    /// | `TETHER_ENDPOINTS`          | yes      | `name=url,...`                      |
    /// | `TETHER_ROOMS`              | no       | `connection:room,...`               |
    /// | `TETHER_AUTH_TOKEN`         | no       | Token sent in the auth handshake    |
    /// | `TETHER_TOKEN_REFRESH_SECS` | no       | Enables the scheduled token refresh |
    ///
    /// Connection options are read by [`ConnectionOptions::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let raw = lookup("TETHER_ENDPOINTS")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing("TETHER_ENDPOINTS".into()))?;
        let endpoints = parse_endpoints(&raw)?;

        let rooms = match lookup("TETHER_ROOMS") {
            Some(raw) => parse_rooms(&raw)?,
            None => Vec::new(),
        };

        let auth_token = lookup("TETHER_AUTH_TOKEN").filter(|t| !t.trim().is_empty());

        let token_refresh = match lookup("TETHER_TOKEN_REFRESH_SECS") {
            None => None,
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(0) => None,
                Ok(secs) => Some(Duration::from_secs(secs)),
                Err(_) => {
                    return Err(ConfigError::Invalid {
                        key: "TETHER_TOKEN_REFRESH_SECS".into(),
                        value: raw,
                    })
                }
            },
        };

        let connection = ConnectionOptions::from_lookup(&lookup)?;

        Ok(Self {
            endpoints,
            rooms,
            auth_token,
            token_refresh,
            connection,
        })
    }
}

fn parse_endpoints(raw: &str) -> Result<Vec<Endpoint>, ConfigError> {
    let mut endpoints: Vec<Endpoint> = Vec::new();
    for entry in split_list(raw) {
        let invalid = || ConfigError::Invalid {
            key: "TETHER_ENDPOINTS".into(),
            value: entry.clone(),
        };
        let (name, url) = entry.split_once('=').ok_or_else(invalid)?;
        let (name, url) = (name.trim(), url.trim());
        if name.is_empty() || url.is_empty() || endpoints.iter().any(|e| e.name == name) {
            return Err(invalid());
        }
        endpoints.push(Endpoint {
            name: name.to_string(),
            url: url.to_string(),
        });
    }
    Ok(endpoints)
}

fn parse_rooms(raw: &str) -> Result<Vec<RoomBinding>, ConfigError> {
    split_list(raw)
        .into_iter()
        .map(|entry| match entry.split_once(':') {
            Some((conn, room)) if !conn.trim().is_empty() && !room.trim().is_empty() => {
                Ok(RoomBinding {
                    connection: conn.trim().to_string(),
                    room: room.trim().to_string(),
                })
            }
            _ => Err(ConfigError::Invalid {
                key: "TETHER_ROOMS".into(),
                value: entry,
            }),
        })
        .collect()
}
