//! In-process transport pair.
//!
//! [`MemoryConnector::pair`] returns a connector and a [`MemoryListener`].
//! Every successful connect hands the listener a [`MemoryPeer`], the server
//! end of that socket. Dropping the peer without calling
//! [`MemoryPeer::close`] looks like an abrupt network loss to the client.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tether_core::Envelope;
use tokio::sync::mpsc;

use super::{CloseInfo, Connector, Frame, Transport, TransportError};

struct Shared {
    attempts: AtomicU64,
    refusing: AtomicBool,
    accepted: mpsc::UnboundedSender<MemoryPeer>,
}

/// Connector whose sockets terminate in a [`MemoryListener`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<Shared>,
}

impl MemoryConnector {
    pub fn pair() -> (MemoryConnector, MemoryListener) {
        let (accepted, incoming) = mpsc::unbounded_channel();
        let connector = MemoryConnector {
            shared: Arc::new(Shared {
                attempts: AtomicU64::new(0),
                refusing: AtomicBool::new(false),
                accepted,
            }),
        };
        (connector, MemoryListener { incoming })
    }

    /// While set, every connect attempt fails with [`TransportError::Connect`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refusing.store(refuse, Ordering::SeqCst);
    }

    /// Total connect attempts so far, refused ones included.
    pub fn attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<Box<dyn Transport>, TransportError> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);

        if self.shared.refusing.load(Ordering::SeqCst) {
            return Err(TransportError::Connect(format!("{url}: connection refused")));
        }

        let (to_peer, from_client) = mpsc::unbounded_channel();
        let (to_client, from_peer) = mpsc::unbounded_channel();

        let peer = MemoryPeer {
            url: url.to_string(),
            protocols: protocols.to_vec(),
            outgoing: to_client,
            incoming: from_client,
        };
        self.shared
            .accepted
            .send(peer)
            .map_err(|_| TransportError::Connect(format!("{url}: listener gone")))?;

        Ok(Box::new(MemoryTransport {
            outgoing: to_peer,
            incoming: from_peer,
        }))
    }
}

/// Receives the server end of each accepted connection.
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<MemoryPeer>,
}

impl MemoryListener {
    /// Wait for the next connection.
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.recv().await
    }

    /// Take an already accepted connection, if any.
    pub fn try_accept(&mut self) -> Option<MemoryPeer> {
        self.incoming.try_recv().ok()
    }
}

/// Server end of an in-memory socket.
pub struct MemoryPeer {
    pub url: String,
    pub protocols: Vec<String>,
    outgoing: mpsc::UnboundedSender<Frame>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

impl MemoryPeer {
    /// Next frame sent by the client. `None` once the client side is gone.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.incoming.recv().await
    }

    /// Next text frame from the client, decoded as an envelope. Non-text
    /// frames are skipped.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.recv().await? {
                Frame::Text(text) => return Some(Envelope::from_wire(&text)),
                _ => continue,
            }
        }
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.outgoing.send(Frame::Text(text.into())).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.to_wire() {
            Ok(text) => self.send_text(text),
            Err(_) => false,
        }
    }

    /// Send a Close frame. The peer stays usable for draining frames.
    pub fn close(&self, code: u16, reason: &str) -> bool {
        self.outgoing
            .send(Frame::Close(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            })))
            .is_ok()
    }
}

struct MemoryTransport {
    outgoing: mpsc::UnboundedSender<Frame>,
    incoming: mpsc::UnboundedReceiver<Frame>,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send_text(&mut self, text: String) -> Result<(), TransportError> {
        self.outgoing
            .send(Frame::Text(text))
            .map_err(|_| TransportError::Closed)
    }

    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>> {
        // mpsc::Receiver::recv is cancel-safe.
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError> {
        self.outgoing
            .send(Frame::Close(Some(CloseInfo {
                code,
                reason: reason.to_string(),
            })))
            .map_err(|_| TransportError::Closed)
    }
}
