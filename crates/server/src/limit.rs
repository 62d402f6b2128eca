//! Admission guard for the `/v1/ws` upgrade: a per-address rate limit and a
//! deadline on producing the upgrade response.

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use phantomias_shared::{metrics::WS_RATE_LIMITED_TOTAL, ProblemDetails};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WsLimitsConfig;
use crate::error::ApiError;

/// Tracked addresses before idle ones are pruned.
const RETAIN_THRESHOLD: usize = 10_000;

/// Limits shared by every `/v1/ws` request.
pub struct WsLimits {
    limiter: DefaultKeyedRateLimiter<IpAddr>,
    exempt_loopback: bool,
    handshake_timeout: Duration,
}

impl WsLimits {
    /// `rate_limit` upgrades may arrive at once; capacity then refills evenly
    /// over `rate_window`.
    pub fn new(config: &WsLimitsConfig) -> Self {
        let burst = NonZeroU32::new(config.rate_limit).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(config.rate_window / burst.get())
            .unwrap_or_else(|| Quota::per_second(burst))
            .allow_burst(burst);

        Self {
            limiter: RateLimiter::keyed(quota),
            exempt_loopback: config.exempt_loopback,
            handshake_timeout: config.handshake_timeout,
        }
    }

    /// Takes one unit of `ip`'s allowance; false once it is spent.
    pub fn admit(&self, ip: IpAddr) -> bool {
        let ip = ip.to_canonical();
        if self.exempt_loopback && ip.is_loopback() {
            return true;
        }
        if self.limiter.len() >= RETAIN_THRESHOLD {
            self.limiter.retain_recent();
        }
        self.limiter.check_key(&ip).is_ok()
    }
}

impl Default for WsLimits {
    fn default() -> Self {
        Self::new(&WsLimitsConfig::default())
    }
}

/// Middleware for the upgrade route.
pub async fn guard_upgrade(
    State(limits): State<Arc<WsLimits>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    if !limits.admit(addr.ip()) {
        metrics::counter!(WS_RATE_LIMITED_TOTAL).increment(1);
        tracing::warn!("rate limit exceeded for {}", addr.ip());
        return ApiError::from(ProblemDetails::too_many_requests(
            "too many WebSocket connections from this address",
        ))
        .into_response();
    }

    match tokio::time::timeout(limits.handshake_timeout, next.run(request)).await {
        Ok(response) => response,
        Err(_) => {
            tracing::warn!("WebSocket handshake from {} timed out", addr);
            ApiError::from(ProblemDetails::request_timeout(
                "WebSocket handshake did not complete in time",
            ))
            .into_response()
        }
    }
}
