//! Per-connection state the agent re-establishes on every `Connected` event.
//!
//! Rooms and auth sessions are purged whenever a connection drops, including
//! losses that later reconnect, so they are restored from configuration each
//! time the socket opens rather than once at startup.

use std::sync::Arc;

use tether_client::{AuthManager, AuthOptions, EventKind, Registry, RoomManager};

use crate::config::RoomBinding;

/// Join the configured rooms of a connection whenever it connects.
pub fn rejoin_rooms_on_connect(
    registry: &Registry,
    rooms: Arc<RoomManager>,
    bindings: Vec<RoomBinding>,
) {
    if bindings.is_empty() {
        return;
    }
    registry.on(EventKind::Connect, move |_, conn| {
        for binding in bindings.iter().filter(|b| b.connection == conn.name()) {
            match rooms.join(&binding.connection, &binding.room) {
                Ok(_) => {
                    tracing::info!(connection = %conn.name(), room = %binding.room, "Joined room")
                }
                Err(e) => {
                    tracing::warn!(connection = %conn.name(), room = %binding.room, error = %e, "Failed to join room")
                }
            }
        }
    });
}

/// Run the auth handshake whenever a connection connects.
///
/// Handlers run on the session task, which also reads the handshake reply,
/// so the handshake is spawned rather than awaited in place.
pub fn authenticate_on_connect(registry: &Registry, auth: Arc<AuthManager>, token: String) {
    registry.on(EventKind::Connect, move |_, conn| {
        let auth = Arc::clone(&auth);
        let token = token.clone();
        let name = conn.name().to_string();
        tokio::spawn(async move {
            if let Err(e) = auth.authenticate(&name, &token, AuthOptions::default()).await {
                tracing::error!(connection = %name, error = %e, "Authentication failed");
            }
        });
    });
}
