//! Inbound message routing for the agent.

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tether_client::{RoomManager, Router};
use tether_core::Envelope;

/// Inbound tag whose payload `{room, data}` is relayed to the other members.
pub const ROOM_MESSAGE: &str = "room.message";

/// Router that relays `room.message` traffic and logs everything else.
pub fn router(rooms: Arc<RoomManager>) -> Router {
    let router = Router::new();

    router.add_route(ROOM_MESSAGE, move |envelope, conn| {
        let room = envelope
            .payload
            .get("room")
            .and_then(Value::as_str)
            .context("room.message without a room")?;
        let data = envelope.payload.get("data").cloned().unwrap_or(Value::Null);

        let report = rooms.broadcast(room, &Envelope::typed(ROOM_MESSAGE, data), Some(conn.name()))?;
        tracing::debug!(
            connection = %conn.name(),
            room = %room,
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            "Relayed room message",
        );
        Ok(())
    });

    router.set_default_handler(|envelope, conn| {
        tracing::info!(
            connection = %conn.name(),
            kind = envelope.tag().unwrap_or("untyped"),
            payload = %envelope.payload,
            "Message received",
        );
        Ok(())
    });

    router
}
