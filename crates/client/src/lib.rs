//! Persistent duplex-connection client.
//!
//! Provides a reconnecting, heartbeat-monitored [`Connection`] with an
//! acknowledgment-based request/response layer, a named [`Registry`] of
//! connections, pattern-based message routing ([`Router`]), room-based
//! fan-out ([`RoomManager`]) and a token authentication handshake
//! ([`AuthManager`]) layered on top.
//!
//! All managers are plain values meant to be shared through `Arc`; nothing
//! here is process-global.

pub mod ack;
pub mod auth;
pub mod config;
pub mod connection;
pub mod events;
pub mod heartbeat;
pub mod reconnect;
pub mod registry;
pub mod rooms;
pub mod router;
pub mod transport;

mod session;

pub use auth::{AuthError, AuthManager, AuthOptions, AuthSession, RefreshHandle, TokenRefresher};
pub use config::{ConfigError, ConnectionOptions};
pub use connection::{Connection, ConnectionError, ConnectionState, Dispatch};
pub use events::{ConnectionEvent, EventHandler, EventKind, HandlerId};
pub use reconnect::Backoff;
pub use registry::{BulkReport, Registry, RegistryError};
pub use rooms::{BroadcastReport, RoomError, RoomManager};
pub use router::{RouteOutcome, RoutePattern, Router};
pub use tether_core::{Envelope, MessageKind};
pub use transport::{
    Connector, Frame, MemoryConnector, MemoryListener, MemoryPeer, Transport, TransportError,
    WsConnector,
};
