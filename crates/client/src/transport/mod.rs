//! Socket abstraction underneath a [`Connection`](crate::Connection).
//!
//! A [`Connector`] opens one duplex [`Transport`] per connect attempt. The
//! production implementation is [`WsConnector`] (WebSocket over
//! tokio-tungstenite); [`memory`] provides an in-process pair used by tests
//! and demos.

pub mod memory;
pub mod websocket;

use async_trait::async_trait;

pub use memory::{MemoryConnector, MemoryListener, MemoryPeer};
pub use websocket::WsConnector;

/// Close code for a normal, intentional closure.
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code used when the client force-closes after a missed pong.
pub const CLOSE_HEARTBEAT_TIMEOUT: u16 = 4000;

/// Close frame details sent by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

/// A data frame surfaced by a transport.
///
/// Protocol-level ping/pong frames are answered by the transport itself and
/// never appear here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close(Option<CloseInfo>),
}

impl Frame {
    /// Whether this frame ends the connection cleanly.
    ///
    /// Only a Close frame with code 1000 counts as clean; a Close without a
    /// code or with any other code is treated as an abnormal closure.
    pub fn is_clean_close(&self) -> bool {
        matches!(self, Frame::Close(Some(info)) if info.code == CLOSE_NORMAL)
    }
}

/// Errors produced by a transport or connector.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The target address could not be turned into a connect request.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Failed to establish the connection.
    #[error("Connection error: {0}")]
    Connect(String),

    /// A read or write on an established connection failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// The connection is already closed.
    #[error("Transport closed")]
    Closed,
}

/// One open duplex channel.
#[async_trait]
pub trait Transport: Send {
    /// Write a text frame.
    async fn send_text(&mut self, text: String) -> Result<(), TransportError>;

    /// Read the next data frame. `None` means the stream ended without a
    /// Close frame.
    ///
    /// Must be cancel-safe: dropping the future before it completes loses
    /// no frame.
    async fn next_frame(&mut self) -> Option<Result<Frame, TransportError>>;

    /// Send a Close frame with the given code and reason.
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), TransportError>;
}

/// Opens transports to a remote address.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<Box<dyn Transport>, TransportError>;
}
