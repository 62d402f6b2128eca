//! Errors surfaced by the reconnecting connection.

use std::time::Duration;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

/// Why an upstream URL was rejected at construction time.
#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("url cannot be empty")]
    Empty,
    #[error(transparent)]
    Parse(#[from] url::ParseError),
    #[error("websocket uris must start with ws or wss scheme, got {0:?}")]
    Scheme(String),
    #[error("user name and password are not allowed in websocket uris")]
    UserInfo,
}

#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// Returned when reading or writing while the connection is down.
    #[error("websocket: not connected")]
    NotConnected,

    #[error("invalid url: {0}")]
    InvalidUrl(#[from] UrlError),

    #[error("dial failed: {0}")]
    Dial(#[source] tungstenite::Error),

    #[error("websocket handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),

    /// The dial was abandoned because its cancellation token fired.
    #[error("dial cancelled")]
    Cancelled,

    #[error("proxy: {0}")]
    Proxy(String),

    #[error(transparent)]
    Transport(#[from] tungstenite::Error),

    #[error("connection closed by peer ({code}): {reason}")]
    Closed { code: CloseCode, reason: String },

    #[error("tls: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, WsError>;
