//! Phantomias upstream client
//!
//! Keeps a reconnecting WebSocket open to the pool backend's notification
//! endpoint and relays every text frame into the local hub.

pub mod config;
pub mod ws;

pub use config::UpstreamConfig;
pub use ws::{ConnectionOptions, RelayExit, UpstreamRelay, WsConnection, WsError};
