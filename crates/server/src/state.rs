//! Application state shared across request handlers.

use phantomias_shared::ConnectionState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::hub::RelayHub;
use crate::limit::WsLimits;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub hub: RelayHub,
    /// Upstream feed state, as published by the relay.
    pub upstream: watch::Receiver<ConnectionState>,
    /// Fires on process shutdown; open sockets stop reading.
    pub shutdown: CancellationToken,
    /// Admission limits for `/v1/ws`.
    pub ws_limits: Arc<WsLimits>,
}

impl AppState {
    pub fn new(
        hub: RelayHub,
        upstream: watch::Receiver<ConnectionState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            hub,
            upstream,
            shutdown,
            ws_limits: Arc::new(WsLimits::default()),
        }
    }

    pub fn with_ws_limits(mut self, limits: WsLimits) -> Self {
        self.ws_limits = Arc::new(limits);
        self
    }

    pub fn upstream_state(&self) -> ConnectionState {
        *self.upstream.borrow()
    }
}
