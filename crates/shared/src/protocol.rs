//! Relay payloads and connection state shared by the server and client crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// An opaque notification payload relayed from the pool backend.
///
/// The relay never looks inside; cloning is a reference-count bump so one
/// payload can be handed to every subscriber.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Notification(Arc<[u8]>);

impl Notification {
    pub fn new(payload: impl Into<Arc<[u8]>>) -> Self {
        Self(payload.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The payload as text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "Notification({:?})", text),
            None => write!(f, "Notification({} bytes)", self.0.len()),
        }
    }
}

impl From<&str> for Notification {
    fn from(value: &str) -> Self {
        Self(Arc::from(value.as_bytes()))
    }
}

impl From<String> for Notification {
    fn from(value: String) -> Self {
        Self(Arc::from(value.into_bytes()))
    }
}

impl From<Vec<u8>> for Notification {
    fn from(value: Vec<u8>) -> Self {
        Self(Arc::from(value))
    }
}

impl From<&[u8]> for Notification {
    fn from(value: &[u8]) -> Self {
        Self(Arc::from(value))
    }
}

/// Lifecycle state of the upstream reconnecting connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Closed,
    Connecting,
    Connected,
    /// Terminal; nothing transitions out of it.
    ClosedForever,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::ClosedForever)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Closed => "closed",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::ClosedForever => "closed_forever",
        };
        f.write_str(s)
    }
}

/// Body of the `/health` endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthReport {
    /// "ok" when the upstream feed is connected, "degraded" otherwise.
    pub status: String,
    pub upstream: ConnectionState,
    pub subscribers: usize,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    pub fn new(upstream: ConnectionState, subscribers: usize) -> Self {
        let status = if upstream.is_connected() { "ok" } else { "degraded" };
        Self {
            status: status.to_string(),
            upstream,
            subscribers,
            checked_at: Utc::now(),
        }
    }
}
