//! WebSocket client for the upstream notification feed.
//!
//! - [`connection`]: a reconnecting connection with backoff and keep-alive
//! - [`relay`]: pumps upstream text frames into the hub's broadcast channel

pub mod connection;
pub mod error;
pub mod relay;

pub use connection::{validate_url, ConnectionOptions, HandshakeResponse, LogFns, WsConnection};
pub use error::{UrlError, WsError};
pub use relay::{RelayExit, UpstreamRelay};
