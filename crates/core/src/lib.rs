//! Wire-level building blocks shared by every tether crate.
//!
//! This crate has zero internal dependencies: it only knows how a message
//! looks on the wire ([`Envelope`], [`MessageKind`]) and how message ids and
//! timestamps are produced.

pub mod ids;
pub mod message;
pub mod types;

pub use ids::generate_message_id;
pub use message::{Envelope, MessageKind};
pub use types::{now_millis, Timestamp};
