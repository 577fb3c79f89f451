//! Networked store: a WebSocket relay and the client that speaks to it.

pub mod client;
pub mod server;

pub use client::{ConnectionState, RelayStore};
pub use server::{RelayConfig, RelayServer, RelayStats};
