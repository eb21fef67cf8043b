//! `tether-agent` library crate.
//!
//! Configuration, routing and reconnect wiring, exposed for integration
//! testing. The binary entrypoint lives in `main.rs`.

pub mod config;
pub mod relay;
pub mod restore;
