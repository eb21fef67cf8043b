//! Per-connection authentication over the acknowledgment protocol.
//!
//! [`AuthManager::authenticate`] sends a `request` envelope whose payload is
//! `{"type":"auth","token":…,"refresh":false,…metadata}` and expects an
//! `ack` whose payload is `{"success":bool,"user":…,"permissions":[…]}`.
//! A session is stored only on success, and a refresh replaces the stored
//! session only on success.

mod refresh;
mod session;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tether_core::{Envelope, MessageKind};
use tokio_util::sync::CancellationToken;

pub use refresh::{RefreshHandle, TokenRefresher};
pub use session::{AuthSession, WILDCARD_PERMISSION};

use self::session::AuthReply;
use crate::connection::{Connection, ConnectionError};
use crate::events::{panic_message, EventKind};
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Connection {0} not found")]
    UnknownConnection(String),

    #[error("Connection {0} is not authenticated")]
    NotAuthenticated(String),

    #[error("Authentication handshake failed: {0}")]
    Handshake(#[from] ConnectionError),

    #[error("Malformed authentication reply: {0}")]
    MalformedReply(String),

    #[error("Authentication rejected: {message}")]
    Rejected { message: String },
}

/// Extra handshake settings.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Merged into the auth request payload.
    pub metadata: Map<String, Value>,
    /// Overrides the connection's `ack_timeout`.
    pub timeout: Option<Duration>,
}

type Sessions = Arc<RwLock<HashMap<String, AuthSession>>>;

pub struct AuthManager {
    registry: Arc<Registry>,
    sessions: Sessions,
}

impl AuthManager {
    /// Create a manager over `registry`. Sessions are dropped when their
    /// connection disconnects or is removed.
    pub fn new(registry: Arc<Registry>) -> Self {
        let sessions: Sessions = Arc::new(RwLock::new(HashMap::new()));

        let on_disconnect = Arc::clone(&sessions);
        registry.on_retroactive(EventKind::Disconnect, move |_, conn: &Connection| {
            if on_disconnect.write().remove(conn.name()).is_some() {
                tracing::debug!(connection = %conn.name(), "Session dropped on disconnect");
            }
        });

        let on_remove = Arc::clone(&sessions);
        registry.on_remove(move |name| {
            on_remove.write().remove(name);
        });

        Self { registry, sessions }
    }

    /// Run the handshake and store the resulting session.
    pub async fn authenticate(
        &self,
        connection: &str,
        token: &str,
        options: AuthOptions,
    ) -> Result<AuthSession, AuthError> {
        let conn = self.connection(connection)?;
        let session = handshake(&conn, token, false, &options).await?;
        self.sessions
            .write()
            .insert(connection.to_string(), session.clone());

        tracing::info!(
            connection = %connection,
            permissions = session.permissions.len(),
            "Authenticated",
        );
        Ok(session)
    }

    /// Re-run the handshake with `new_token`. The existing session is
    /// replaced only on success and left untouched on failure.
    pub async fn refresh_token(
        &self,
        connection: &str,
        new_token: &str,
    ) -> Result<AuthSession, AuthError> {
        let conn = self.connection(connection)?;
        if !self.sessions.read().contains_key(connection) {
            return Err(AuthError::NotAuthenticated(connection.to_string()));
        }

        let session = handshake(&conn, new_token, true, &AuthOptions::default()).await?;
        self.sessions
            .write()
            .insert(connection.to_string(), session.clone());

        tracing::info!(connection = %connection, "Token refreshed");
        Ok(session)
    }

    /// Drop the session and send a fire-and-forget `deauth` notice.
    /// Returns whether a session existed.
    pub fn deauthenticate(&self, connection: &str) -> bool {
        let existed = self.sessions.write().remove(connection).is_some();

        if let Some(conn) = self.registry.get(connection) {
            if let Err(e) = conn.send(&Envelope::typed(MessageKind::Deauth, Value::Null)) {
                tracing::warn!(connection = %connection, error = %e, "Failed to send deauth notice");
            }
        }

        if existed {
            tracing::info!(connection = %connection, "Deauthenticated");
        }
        existed
    }

    /// Whether an unexpired session exists.
    pub fn is_authenticated(&self, connection: &str) -> bool {
        self.sessions
            .read()
            .get(connection)
            .is_some_and(|s| !s.is_expired())
    }

    pub fn has_permission(&self, connection: &str, permission: &str) -> bool {
        self.sessions
            .read()
            .get(connection)
            .is_some_and(|s| !s.is_expired() && s.has_permission(permission))
    }

    pub fn session(&self, connection: &str) -> Option<AuthSession> {
        self.sessions.read().get(connection).cloned()
    }

    /// Names of connections with a stored session, sorted.
    pub fn authenticated_connections(&self) -> Vec<String> {
        let mut names: Vec<String> = self.sessions.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Every `interval`, ask `refresher` for a new token for each
    /// authenticated connection and feed it into
    /// [`refresh_token`](Self::refresh_token). Failures, including a
    /// panicking refresher, are logged per connection and never stop the
    /// loop. Dropping the returned handle also stops it.
    pub fn start_token_refresh<R>(self: &Arc<Self>, interval: Duration, refresher: R) -> RefreshHandle
    where
        R: TokenRefresher + 'static,
    {
        let manager = Arc::clone(self);
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "Token refresh started");
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = manager.refresh_all(&refresher) => {}
                }
            }
            tracing::info!("Token refresh stopped");
        });

        RefreshHandle::new(cancel, handle, interval)
    }

    async fn refresh_all<R: TokenRefresher + ?Sized>(&self, refresher: &R) {
        for name in self.authenticated_connections() {
            let token = match AssertUnwindSafe(refresher.refresh(&name)).catch_unwind().await {
                Ok(Ok(token)) => token,
                Ok(Err(e)) => {
                    tracing::warn!(connection = %name, error = %e, "Token refresher failed");
                    continue;
                }
                Err(payload) => {
                    tracing::error!(
                        connection = %name,
                        panic = %panic_message(payload.as_ref()),
                        "Token refresher panicked",
                    );
                    continue;
                }
            };
            if let Err(e) = self.refresh_token(&name, &token).await {
                tracing::warn!(connection = %name, error = %e, "Token refresh failed");
            }
        }
    }

    fn connection(&self, name: &str) -> Result<Connection, AuthError> {
        self.registry
            .get(name)
            .ok_or_else(|| AuthError::UnknownConnection(name.to_string()))
    }
}

async fn handshake(
    conn: &Connection,
    token: &str,
    refresh: bool,
    options: &AuthOptions,
) -> Result<AuthSession, AuthError> {
    let mut payload = options.metadata.clone();
    payload.insert("type".into(), Value::from(MessageKind::Auth.as_str()));
    payload.insert("token".into(), Value::from(token));
    payload.insert("refresh".into(), Value::Bool(refresh));

    let timeout = options.timeout.unwrap_or(conn.options().ack_timeout);
    let ack = conn.send_with_ack(Value::Object(payload), timeout).await?;

    let reply: AuthReply = serde_json::from_value(ack.payload)
        .map_err(|e| AuthError::MalformedReply(e.to_string()))?;

    if !reply.success {
        let message = reply
            .message
            .clone()
            .unwrap_or_else(|| "authentication failed".to_string());
        tracing::warn!(connection = %conn.name(), reason = %message, "Authentication rejected");
        return Err(AuthError::Rejected { message });
    }

    Ok(AuthSession::from_reply(token.to_string(), reply))
}
