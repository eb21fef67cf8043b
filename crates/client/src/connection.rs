//! A single persistent duplex connection.
//!
//! [`Connection`] is a cheap, cloneable handle. The socket itself is owned by
//! a session task spawned on [`Connection::connect`]; the task opens the
//! socket, runs the heartbeat, flushes the outbound queue and reconnects
//! after unclean losses until the attempt budget runs out or
//! [`Connection::disconnect`] is called.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Reconnecting <-> Connecting
//!                                   |
//!                                   v
//!                                Closing -> Closed
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tether_core::{generate_message_id, Envelope, MessageKind, Timestamp};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::ack::PendingAcks;
use crate::config::ConnectionOptions;
use crate::events::{catch_panic, ConnectionEvent, EventHandler, EventKind, HandlerId, HandlerTable};
use crate::session;
use crate::transport::{Connector, TransportError};

/// Broadcast channel capacity for connection events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// What happened to an outbound message.
///
/// Informational only; queued messages are flushed on the next open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the live socket.
    Immediate,
    /// Appended to the outbound queue.
    Queued,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No acknowledgment for message {id} within {timeout:?}")]
    AckTimeout { id: String, timeout: Duration },

    #[error("Acknowledgment for message {id} was cancelled")]
    AckCancelled { id: String },

    #[error("Message id {0} already awaits an acknowledgment")]
    DuplicateId(String),

    #[error("Connect attempt was cancelled")]
    Cancelled,

    #[error("Connection is closing")]
    Closing,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Inner {
    pub(crate) name: String,
    pub(crate) url: String,
    pub(crate) options: ConnectionOptions,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) link: Mutex<Link>,
    pub(crate) pending: PendingAcks,
    pub(crate) handlers: HandlerTable,
    pub(crate) events: broadcast::Sender<ConnectionEvent>,
}

/// Mutable connection state, guarded by one short-lived lock.
pub(crate) struct Link {
    pub(crate) state: ConnectionState,
    pub(crate) reconnect_attempts: u32,
    /// Messages waiting for an open socket, oldest first.
    pub(crate) queue: VecDeque<String>,
    /// Feeds the live socket; `Some` only while connected.
    pub(crate) outbound: Option<mpsc::UnboundedSender<String>>,
    pub(crate) task: Option<SessionTask>,
    pub(crate) latency: Option<Duration>,
    pub(crate) last_ping_at: Option<Timestamp>,
}

pub(crate) struct SessionTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// Handle to one named duplex channel.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    pub fn new(
        name: impl Into<String>,
        url: impl Into<String>,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                url: url.into(),
                options,
                connector,
                link: Mutex::new(Link {
                    state: ConnectionState::Disconnected,
                    reconnect_attempts: 0,
                    queue: VecDeque::new(),
                    outbound: None,
                    task: None,
                    latency: None,
                    last_ping_at: None,
                }),
                pending: PendingAcks::new(),
                handlers: HandlerTable::default(),
                events,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    // ---- lifecycle ----

    /// Open the socket and wait for the first attempt to finish.
    ///
    /// A no-op while already connecting or connected. While waiting to
    /// reconnect, the pending retry is abandoned and a fresh attempt starts
    /// at once with the attempt counter reset. When the first attempt fails
    /// its error is returned and reconnection carries on in the background.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        {
            let mut link = self.inner.link.lock();
            match link.state {
                ConnectionState::Connecting | ConnectionState::Connected => return Ok(()),
                ConnectionState::Closing => return Err(ConnectionError::Closing),
                // A session sleeping before its next retry is replaced below.
                ConnectionState::Reconnecting
                | ConnectionState::Disconnected
                | ConnectionState::Closed => {}
            }

            link.reconnect_attempts = 0;
            link.state = ConnectionState::Connecting;

            let cancel = CancellationToken::new();
            let handle = tokio::spawn(session::run(
                Arc::clone(&self.inner),
                cancel.clone(),
                ready_tx,
            ));
            if let Some(previous) = link.task.replace(SessionTask { cancel, handle }) {
                previous.cancel.cancel();
            }
        }

        tracing::debug!(connection = %self.inner.name, url = %self.inner.url, "Connecting");

        match ready_rx.await {
            Ok(result) => result.map_err(ConnectionError::from),
            Err(_) => Err(ConnectionError::Cancelled),
        }
    }

    /// Close intentionally. No reconnection follows; the session task has
    /// exited by the time this returns.
    pub async fn disconnect(&self) {
        let task = {
            let mut link = self.inner.link.lock();
            link.reconnect_attempts = self.inner.options.max_reconnect_attempts;
            link.state = ConnectionState::Closing;
            let task = link.task.take();
            if let Some(task) = &task {
                task.cancel.cancel();
            }
            task
        };

        if let Some(task) = task {
            if let Err(e) = task.handle.await {
                tracing::warn!(connection = %self.inner.name, error = %e, "Session task failed");
            }
        }

        {
            let mut link = self.inner.link.lock();
            link.state = ConnectionState::Closed;
            link.outbound = None;
        }

        if self.inner.options.fail_pending_on_disconnect {
            let failed = self.inner.pending.fail_all();
            if failed > 0 {
                tracing::debug!(
                    connection = %self.inner.name,
                    failed,
                    "Failed pending acknowledgments",
                );
            }
        }

        tracing::info!(connection = %self.inner.name, "Disconnected");
    }

    // ---- sending ----

    /// Transmit raw text now if connected, otherwise queue it.
    pub fn send_text(&self, text: impl Into<String>) -> Dispatch {
        let mut text = text.into();
        let mut link = self.inner.link.lock();

        if link.state == ConnectionState::Connected {
            if let Some(outbound) = &link.outbound {
                match outbound.send(text) {
                    Ok(()) => return Dispatch::Immediate,
                    Err(mpsc::error::SendError(returned)) => text = returned,
                }
            }
        }

        link.queue.push_back(text);
        Dispatch::Queued
    }

    pub fn send(&self, envelope: &Envelope) -> Result<Dispatch, ConnectionError> {
        Ok(self.send_text(envelope.to_wire()?))
    }

    /// Serialize any value as the frame body.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<Dispatch, ConnectionError> {
        Ok(self.send_text(serde_json::to_string(value)?))
    }

    /// Send a typed envelope without an id.
    pub fn emit(
        &self,
        kind: impl Into<MessageKind>,
        payload: Value,
    ) -> Result<Dispatch, ConnectionError> {
        self.send(&Envelope::typed(kind, payload))
    }

    /// Send `payload` as a `request` and wait for the `ack` carrying the
    /// same id.
    ///
    /// The pending entry is removed on ack, on timeout, and when the
    /// returned future is dropped.
    pub async fn send_with_ack(
        &self,
        payload: Value,
        timeout: Duration,
    ) -> Result<Envelope, ConnectionError> {
        let id = generate_message_id();
        let (guard, rx) = self
            .inner
            .pending
            .register(&id)
            .map_err(|_| ConnectionError::DuplicateId(id.clone()))?;

        self.send(&Envelope::request(id.clone(), payload))?;

        let result = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(ConnectionError::AckCancelled { id }),
            Err(_) => {
                tracing::debug!(connection = %self.inner.name, id = %id, "Acknowledgment timed out");
                Err(ConnectionError::AckTimeout { id, timeout })
            }
        };
        drop(guard);
        result
    }

    /// [`send_with_ack`](Self::send_with_ack) using the configured
    /// `ack_timeout`.
    pub async fn request(&self, payload: Value) -> Result<Envelope, ConnectionError> {
        self.send_with_ack(payload, self.inner.options.ack_timeout).await
    }

    // ---- events ----

    /// Register a handler for one event kind. Handlers run on the session
    /// task in registration order; a panicking handler is logged and
    /// skipped.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> HandlerId
    where
        F: Fn(&ConnectionEvent, &Connection) + Send + Sync + 'static,
    {
        self.add_handler(kind, Arc::new(handler))
    }

    pub fn add_handler(&self, kind: EventKind, handler: EventHandler) -> HandlerId {
        self.inner.handlers.add(kind, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.inner.handlers.remove(id)
    }

    /// Stream of every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn dispatch(&self, event: ConnectionEvent) {
        let kind = event.kind();
        for handler in self.inner.handlers.matching(&kind) {
            if let Err(panic) = catch_panic(|| handler(&event, self)) {
                tracing::error!(
                    connection = %self.inner.name,
                    event = ?kind,
                    panic = %panic,
                    "Event handler panicked",
                );
            }
        }
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }

    // ---- introspection ----

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.link.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.link.lock().reconnect_attempts
    }

    /// Messages waiting for an open socket.
    pub fn queued_len(&self) -> usize {
        self.inner.link.lock().queue.len()
    }

    pub fn pending_ack_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Round-trip time of the last answered heartbeat ping.
    pub fn latency(&self) -> Option<Duration> {
        self.inner.link.lock().latency
    }

    pub fn last_ping_at(&self) -> Option<Timestamp> {
        self.inner.link.lock().last_ping_at
    }

    /// Whether a session task is still running (connected, connecting, or
    /// waiting to reconnect).
    pub fn has_active_session(&self) -> bool {
        self.inner
            .link
            .lock()
            .task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Whether two handles refer to the same connection.
    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;

    fn connection() -> Connection {
        let (connector, _listener) = MemoryConnector::pair();
        Connection::new("a", "mem://a", ConnectionOptions::default(), Arc::new(connector))
    }

    #[test]
    fn starts_disconnected() {
        let conn = connection();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.reconnect_attempts(), 0);
        assert!(!conn.has_active_session());
        assert!(conn.latency().is_none());
    }

    #[test]
    fn sends_queue_while_disconnected() {
        let conn = connection();
        assert_eq!(conn.send_text("one"), Dispatch::Queued);
        assert_eq!(conn.emit("chat", Value::Null).unwrap(), Dispatch::Queued);
        assert_eq!(conn.queued_len(), 2);
    }

    #[test]
    fn clones_share_state() {
        let conn = connection();
        let other = conn.clone();
        other.send_text("x");
        assert_eq!(conn.queued_len(), 1);
        assert!(conn.same_as(&other));
    }

    #[tokio::test]
    async fn disconnect_without_session_closes() {
        let conn = connection();
        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }
}
