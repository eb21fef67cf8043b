//! Room membership and broadcast fan-out.
//!
//! Membership is kept in two mirrored indices (room to members, connection
//! to rooms). Empty entries are pruned from both sides. A connection leaves
//! every room when it disconnects or is removed from the registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tether_core::Envelope;

use crate::connection::{Connection, ConnectionError};
use crate::events::EventKind;
use crate::registry::Registry;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("Connection {0} not found")]
    UnknownConnection(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Outcome of a room broadcast.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Members the message was handed to.
    pub delivered: Vec<String>,
    /// Members skipped because they were missing or not connected.
    pub skipped: Vec<String>,
}

// ---------------------------------------------------------------------------
// RoomIndex
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct RoomIndex {
    rooms: HashMap<String, HashSet<String>>,
    memberships: HashMap<String, HashSet<String>>,
}

impl RoomIndex {
    fn join(&mut self, connection: &str, room: &str) -> bool {
        let added = self
            .rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection.to_string());
        self.memberships
            .entry(connection.to_string())
            .or_default()
            .insert(room.to_string());
        added
    }

    fn leave(&mut self, connection: &str, room: &str) -> bool {
        let removed = match self.rooms.get_mut(room) {
            Some(members) => {
                let removed = members.remove(connection);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
                removed
            }
            None => false,
        };
        if let Some(rooms) = self.memberships.get_mut(connection) {
            rooms.remove(room);
            if rooms.is_empty() {
                self.memberships.remove(connection);
            }
        }
        removed
    }

    fn leave_all(&mut self, connection: &str) -> Vec<String> {
        let Some(rooms) = self.memberships.remove(connection) else {
            return Vec::new();
        };
        for room in &rooms {
            if let Some(members) = self.rooms.get_mut(room) {
                members.remove(connection);
                if members.is_empty() {
                    self.rooms.remove(room);
                }
            }
        }
        let mut left: Vec<String> = rooms.into_iter().collect();
        left.sort();
        left
    }

    fn members(&self, room: &str) -> Vec<String> {
        sorted(self.rooms.get(room))
    }

    fn rooms_of(&self, connection: &str) -> Vec<String> {
        sorted(self.memberships.get(connection))
    }
}

fn sorted(set: Option<&HashSet<String>>) -> Vec<String> {
    let mut items: Vec<String> = set.map(|s| s.iter().cloned().collect()).unwrap_or_default();
    items.sort();
    items
}

// ---------------------------------------------------------------------------
// RoomManager
// ---------------------------------------------------------------------------

pub struct RoomManager {
    registry: Arc<Registry>,
    index: Arc<Mutex<RoomIndex>>,
}

impl RoomManager {
    /// Create a manager over `registry`. Existing and future connections
    /// leave all rooms on disconnect; removed connections are purged.
    pub fn new(registry: Arc<Registry>) -> Self {
        let index = Arc::new(Mutex::new(RoomIndex::default()));

        let on_disconnect = Arc::clone(&index);
        registry.on_retroactive(EventKind::Disconnect, move |_, conn: &Connection| {
            let left = on_disconnect.lock().leave_all(conn.name());
            if !left.is_empty() {
                tracing::debug!(connection = %conn.name(), rooms = ?left, "Left rooms on disconnect");
            }
        });

        let on_remove = Arc::clone(&index);
        registry.on_remove(move |name| {
            on_remove.lock().leave_all(name);
        });

        Self { registry, index }
    }

    /// Add a connection to a room, creating the room on first join.
    /// Returns false if it was already a member.
    pub fn join(&self, connection: &str, room: &str) -> Result<bool, RoomError> {
        if !self.registry.contains(connection) {
            return Err(RoomError::UnknownConnection(connection.to_string()));
        }
        let added = self.index.lock().join(connection, room);
        if added {
            tracing::debug!(connection = %connection, room = %room, "Joined room");
        }
        Ok(added)
    }

    /// Remove a connection from a room. Returns false if it was not a
    /// member.
    pub fn leave(&self, connection: &str, room: &str) -> bool {
        let removed = self.index.lock().leave(connection, room);
        if removed {
            tracing::debug!(connection = %connection, room = %room, "Left room");
        }
        removed
    }

    /// Remove a connection from every room. Returns the rooms it left.
    pub fn leave_all(&self, connection: &str) -> Vec<String> {
        self.index.lock().leave_all(connection)
    }

    pub fn get_room_members(&self, room: &str) -> Vec<String> {
        self.index.lock().members(room)
    }

    pub fn get_all_rooms(&self) -> Vec<String> {
        let mut rooms: Vec<String> = self.index.lock().rooms.keys().cloned().collect();
        rooms.sort();
        rooms
    }

    pub fn rooms_of(&self, connection: &str) -> Vec<String> {
        self.index.lock().rooms_of(connection)
    }

    pub fn room_size(&self, room: &str) -> usize {
        self.index.lock().rooms.get(room).map_or(0, HashSet::len)
    }

    pub fn is_member(&self, connection: &str, room: &str) -> bool {
        self.index
            .lock()
            .rooms
            .get(room)
            .is_some_and(|members| members.contains(connection))
    }

    /// Send `envelope` to every connected member except `exclude`.
    /// Members that are not connected are skipped, not queued.
    pub fn broadcast(
        &self,
        room: &str,
        envelope: &Envelope,
        exclude: Option<&str>,
    ) -> Result<BroadcastReport, RoomError> {
        let text = envelope.to_wire().map_err(ConnectionError::from)?;
        Ok(self.fan_out(room, &text, exclude))
    }

    /// Serialize `value` once and send it like [`broadcast`](Self::broadcast).
    pub fn broadcast_json<T: Serialize + ?Sized>(
        &self,
        room: &str,
        value: &T,
        exclude: Option<&str>,
    ) -> Result<BroadcastReport, RoomError> {
        let text = serde_json::to_string(value).map_err(ConnectionError::from)?;
        Ok(self.fan_out(room, &text, exclude))
    }

    fn fan_out(&self, room: &str, text: &str, exclude: Option<&str>) -> BroadcastReport {
        let members = self.get_room_members(room);
        let mut report = BroadcastReport::default();

        for member in members {
            if exclude == Some(member.as_str()) {
                continue;
            }
            match self.registry.get(&member) {
                Some(conn) if conn.is_connected() => {
                    conn.send_text(text);
                    report.delivered.push(member);
                }
                _ => report.skipped.push(member),
            }
        }

        tracing::debug!(
            room = %room,
            delivered = report.delivered.len(),
            skipped = report.skipped.len(),
            "Broadcast",
        );
        report
    }
}
