//! Lifecycle and data events emitted by a [`Connection`].
//!
//! Events reach consumers two ways: synchronous handlers registered with
//! [`Connection::on`], and the [`tokio::sync::broadcast`] stream returned by
//! [`Connection::subscribe`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tether_core::{Envelope, MessageKind};

use crate::connection::Connection;

// ---------------------------------------------------------------------------
// ConnectionEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The socket opened.
    Connected { connection: String },

    /// The socket closed. `clean` is true only for a normal (1000) close.
    Disconnected {
        connection: String,
        code: Option<u16>,
        reason: String,
        clean: bool,
    },

    /// A connect attempt or socket operation failed.
    Error { connection: String, message: String },

    /// A reconnection attempt is scheduled.
    ReconnectAttempt {
        connection: String,
        attempt: u32,
        max_attempts: u32,
    },

    /// No pong arrived in time; the socket is being force-closed.
    HeartbeatTimeout { connection: String },

    /// Any inbound message not consumed by the protocol layer.
    Message {
        connection: String,
        envelope: Envelope,
    },

    /// Emitted after [`ConnectionEvent::Message`] for typed envelopes, keyed
    /// by the envelope's tag.
    Typed {
        connection: String,
        kind: MessageKind,
        envelope: Envelope,
    },
}

impl ConnectionEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ConnectionEvent::Connected { .. } => EventKind::Connect,
            ConnectionEvent::Disconnected { .. } => EventKind::Disconnect,
            ConnectionEvent::Error { .. } => EventKind::Error,
            ConnectionEvent::ReconnectAttempt { .. } => EventKind::ReconnectAttempt,
            ConnectionEvent::HeartbeatTimeout { .. } => EventKind::HeartbeatTimeout,
            ConnectionEvent::Message { .. } => EventKind::Message,
            ConnectionEvent::Typed { kind, .. } => EventKind::Type(kind.clone()),
        }
    }

    /// Name of the connection that emitted the event.
    pub fn connection(&self) -> &str {
        match self {
            ConnectionEvent::Connected { connection }
            | ConnectionEvent::Disconnected { connection, .. }
            | ConnectionEvent::Error { connection, .. }
            | ConnectionEvent::ReconnectAttempt { connection, .. }
            | ConnectionEvent::HeartbeatTimeout { connection }
            | ConnectionEvent::Message { connection, .. }
            | ConnectionEvent::Typed { connection, .. } => connection,
        }
    }

    /// The envelope carried by data events.
    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            ConnectionEvent::Message { envelope, .. } | ConnectionEvent::Typed { envelope, .. } => {
                Some(envelope)
            }
            _ => None,
        }
    }
}

/// Key for handler registration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
    Error,
    ReconnectAttempt,
    HeartbeatTimeout,
    Message,
    /// The dynamic event named after an inbound message's `type`.
    Type(MessageKind),
}

impl EventKind {
    /// Shorthand for `EventKind::Type(tag.into())`.
    pub fn typed(tag: impl Into<MessageKind>) -> Self {
        EventKind::Type(tag.into())
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub type EventHandler = Arc<dyn Fn(&ConnectionEvent, &Connection) + Send + Sync>;

/// Returned by [`Connection::on`]; pass to [`Connection::off`] to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

#[derive(Default)]
pub(crate) struct HandlerTable {
    next_id: AtomicU64,
    entries: RwLock<Vec<(HandlerId, EventKind, EventHandler)>>,
}

impl HandlerTable {
    pub(crate) fn add(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, kind, handler));
        id
    }

    pub(crate) fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(entry_id, _, _)| *entry_id != id);
        entries.len() != before
    }

    /// Handlers registered for `kind`, in registration order. Cloned out so
    /// handlers may register or remove handlers while running.
    pub(crate) fn matching(&self, kind: &EventKind) -> Vec<EventHandler> {
        self.entries
            .read()
            .iter()
            .filter(|(_, entry_kind, _)| entry_kind == kind)
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}

/// Run `f`, turning a panic into an error message.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|payload| panic_message(payload.as_ref()))
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventHandler {
        Arc::new(|_: &ConnectionEvent, _: &Connection| {})
    }

    #[test]
    fn matching_filters_by_kind_in_order() {
        let table = HandlerTable::default();
        table.add(EventKind::Connect, noop());
        table.add(EventKind::Message, noop());
        table.add(EventKind::Connect, noop());

        assert_eq!(table.matching(&EventKind::Connect).len(), 2);
        assert_eq!(table.matching(&EventKind::Message).len(), 1);
        assert!(table.matching(&EventKind::Error).is_empty());
    }

    #[test]
    fn remove_by_id() {
        let table = HandlerTable::default();
        let id = table.add(EventKind::Connect, noop());
        table.add(EventKind::Connect, noop());

        assert!(table.remove(id));
        assert!(!table.remove(id));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn typed_kind_matches_tag() {
        let event = ConnectionEvent::Typed {
            connection: "a".into(),
            kind: MessageKind::from("chat"),
            envelope: Envelope::typed("chat", serde_json::Value::Null),
        };
        assert_eq!(event.kind(), EventKind::typed("chat"));
        assert_eq!(event.connection(), "a");
        assert!(event.envelope().is_some());
    }

    #[test]
    fn catch_panic_reports_message() {
        let result: Result<(), String> = catch_panic(|| panic!("boom"));
        assert_eq!(result.unwrap_err(), "boom");
        assert_eq!(catch_panic(|| 7).unwrap(), 7);
    }
}
