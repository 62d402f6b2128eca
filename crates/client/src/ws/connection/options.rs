//! Connection options for [`WsConnection`](super::WsConnection).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::http::HeaderMap;
use tokio_tungstenite::Connector;
use url::Url;

use crate::ws::error::WsError;
use super::proxy::{proxy_from_env, ProxyFn};

/// Log sinks the connection reports through.
///
/// Both default to `tracing`; callers swap them to tag or redirect output.
#[derive(Clone)]
pub struct LogFns {
    pub debug: Arc<dyn Fn(&str) + Send + Sync>,
    pub error: Arc<dyn Fn(&WsError, &str) + Send + Sync>,
}

impl Default for LogFns {
    fn default() -> Self {
        Self {
            debug: Arc::new(|msg| tracing::debug!("{}", msg)),
            error: Arc::new(|err, msg| tracing::error!("{}: {}", msg, err)),
        }
    }
}

/// Immutable configuration snapshot, taken once at construction.
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Initial reconnecting interval.
    pub reconnect_interval_min: Duration,
    /// Upper bound of the reconnecting interval.
    pub reconnect_interval_max: Duration,
    /// Rate of increase of the reconnecting interval.
    pub reconnect_interval_factor: f64,
    /// Jitter as a fraction of each growth step, clamped to `0.0..=0.5`.
    pub reconnect_jitter: f64,
    /// Seed for the jitter generator; `None` seeds from entropy.
    pub jitter_seed: Option<u64>,
    /// Stop reconnecting when the server sends a normal closure.
    pub respect_server_closure: bool,
    pub handshake_timeout: Duration,
    /// Picks the HTTP proxy for a target url, if any.
    pub proxy: ProxyFn,
    /// TLS connector used for `wss` targets; `None` uses the system default.
    pub tls_connector: Option<Connector>,
    /// Ping interval and pong deadline. Zero disables keep-alive.
    pub keep_alive_timeout: Duration,
    /// Fires after every successful dial, including reconnects.
    pub on_connect: Arc<dyn Fn() + Send + Sync>,
    /// Extra headers sent with the opening handshake.
    pub request_headers: HeaderMap,
    pub log: LogFns,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            reconnect_interval_min: Duration::from_secs(2),
            reconnect_interval_max: Duration::from_secs(30),
            reconnect_interval_factor: 1.5,
            reconnect_jitter: 0.5,
            jitter_seed: None,
            respect_server_closure: false,
            handshake_timeout: Duration::from_secs(2),
            proxy: Arc::new(proxy_from_env),
            tls_connector: None,
            keep_alive_timeout: Duration::ZERO,
            on_connect: Arc::new(|| {}),
            request_headers: HeaderMap::new(),
            log: LogFns::default(),
        }
    }
}

impl ConnectionOptions {
    pub fn keep_alive_enabled(&self) -> bool {
        !self.keep_alive_timeout.is_zero()
    }

    pub(crate) fn proxy_for(&self, target: &Url) -> Option<Url> {
        (self.proxy)(target)
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("reconnect_interval_min", &self.reconnect_interval_min)
            .field("reconnect_interval_max", &self.reconnect_interval_max)
            .field("reconnect_interval_factor", &self.reconnect_interval_factor)
            .field("reconnect_jitter", &self.reconnect_jitter)
            .field("jitter_seed", &self.jitter_seed)
            .field("respect_server_closure", &self.respect_server_closure)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("tls_connector", &self.tls_connector.is_some())
            .field("keep_alive_timeout", &self.keep_alive_timeout)
            .field("request_headers", &self.request_headers)
            .finish_non_exhaustive()
    }
}
