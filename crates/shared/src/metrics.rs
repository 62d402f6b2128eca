//! Names of the counters and gauges the relay records.
//!
//! Both sides record through the `metrics` facade; the server's metrics
//! endpoint renders whatever recorder the binary installs.

/// Gauge: subscribers currently registered with the hub.
pub const SUBSCRIBERS: &str = "phantomias_subscribers";
/// Counter: subscribers ever registered.
pub const SUBSCRIBERS_TOTAL: &str = "phantomias_subscribers_total";
/// Counter: notifications fanned out by the hub.
pub const BROADCASTS_TOTAL: &str = "phantomias_broadcasts_total";
/// Counter: upstream connections re-established after a drop.
pub const UPSTREAM_RECONNECTS_TOTAL: &str = "phantomias_upstream_reconnects_total";
/// Counter: `/v1/ws` upgrades refused by the per-address limit.
pub const WS_RATE_LIMITED_TOTAL: &str = "phantomias_ws_rate_limited_total";
