//! Server configuration from environment variables.

use anyhow::{anyhow, bail, Context};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    /// Pending requests each hub channel can hold.
    pub hub_capacity: usize,
    /// Guards on the `/v1/ws` upgrade.
    pub ws: WsLimitsConfig,
    /// Prometheus endpoint; `None` when disabled.
    pub metrics: Option<MetricsConfig>,
}

/// Per-address admission and handshake deadline for `/v1/ws`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsLimitsConfig {
    /// Upgrades allowed per address within `rate_window`.
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Loopback peers skip the limit.
    pub exempt_loopback: bool,
    pub handshake_timeout: Duration,
}

impl Default for WsLimitsConfig {
    fn default() -> Self {
        Self {
            rate_limit: 1000,
            rate_window: Duration::from_secs(10),
            exempt_loopback: true,
            handshake_timeout: Duration::from_secs(20),
        }
    }
}

/// The metrics listener, separate from the public one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsConfig {
    pub listen: SocketAddr,
    /// Path the exposition is served on.
    pub endpoint: String,
    pub credentials: Option<BasicCredentials>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3001)),
            endpoint: "/metrics".to_string(),
            credentials: None,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct BasicCredentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for BasicCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            hub_capacity: 256,
            ws: WsLimitsConfig::default(),
            metrics: None,
        }
    }
}

impl ServerConfig {
    /// Parse the server configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PHANTOMIAS_LISTEN`: listen address (default: "0.0.0.0:8080")
    /// - `PHANTOMIAS_HUB_CAPACITY`: hub channel capacity (default: 256)
    /// - `PHANTOMIAS_WS_RATE_LIMIT`: upgrades per address per window (default: 1000)
    /// - `PHANTOMIAS_WS_RATE_WINDOW_SECS`: rate window in seconds (default: 10)
    /// - `PHANTOMIAS_WS_RATE_EXEMPT_LOOPBACK`: skip the limit for loopback peers (default: true)
    /// - `PHANTOMIAS_WS_HANDSHAKE_TIMEOUT_SECS`: upgrade deadline in seconds (default: 20)
    /// - `PHANTOMIAS_METRICS_ENABLED`: serve Prometheus metrics (default: false)
    /// - `PHANTOMIAS_METRICS_LISTEN`: metrics listen address (default: "0.0.0.0:3001")
    /// - `PHANTOMIAS_METRICS_ENDPOINT`: metrics path (default: "/metrics")
    /// - `PHANTOMIAS_METRICS_USER` / `PHANTOMIAS_METRICS_PASSWORD`: basic auth,
    ///   required only when both are set
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let listen = parse_or(&lookup, "PHANTOMIAS_LISTEN", defaults.listen)?;
        let hub_capacity = parse_or(&lookup, "PHANTOMIAS_HUB_CAPACITY", defaults.hub_capacity)?;

        let ws_defaults = WsLimitsConfig::default();
        let rate_limit = parse_or(&lookup, "PHANTOMIAS_WS_RATE_LIMIT", ws_defaults.rate_limit)?;
        if rate_limit == 0 {
            bail!("PHANTOMIAS_WS_RATE_LIMIT must be at least 1");
        }
        let ws = WsLimitsConfig {
            rate_limit,
            rate_window: secs_or(
                &lookup,
                "PHANTOMIAS_WS_RATE_WINDOW_SECS",
                ws_defaults.rate_window,
            )?,
            exempt_loopback: parse_bool_or(
                &lookup,
                "PHANTOMIAS_WS_RATE_EXEMPT_LOOPBACK",
                ws_defaults.exempt_loopback,
            )?,
            handshake_timeout: secs_or(
                &lookup,
                "PHANTOMIAS_WS_HANDSHAKE_TIMEOUT_SECS",
                ws_defaults.handshake_timeout,
            )?,
        };

        let metrics = if parse_bool_or(&lookup, "PHANTOMIAS_METRICS_ENABLED", false)? {
            let metrics_defaults = MetricsConfig::default();
            let endpoint = lookup("PHANTOMIAS_METRICS_ENDPOINT")
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
                .map(|raw| {
                    if raw.starts_with('/') {
                        raw
                    } else {
                        format!("/{}", raw)
                    }
                })
                .unwrap_or(metrics_defaults.endpoint);
            let credentials = match (
                lookup("PHANTOMIAS_METRICS_USER").filter(|v| !v.is_empty()),
                lookup("PHANTOMIAS_METRICS_PASSWORD").filter(|v| !v.is_empty()),
            ) {
                (Some(user), Some(password)) => Some(BasicCredentials { user, password }),
                _ => None,
            };
            Some(MetricsConfig {
                listen: parse_or(&lookup, "PHANTOMIAS_METRICS_LISTEN", metrics_defaults.listen)?,
                endpoint,
                credentials,
            })
        } else {
            None
        };

        Ok(Self {
            listen,
            hub_capacity,
            ws,
            metrics,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn secs_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    let secs: u64 = parse_or(lookup, key, default.as_secs())?;
    if secs == 0 {
        bail!("{} must be at least 1", key);
    }
    Ok(Duration::from_secs(secs))
}

fn parse_bool_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid value for {}: {:?}", key, v)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        let cfg = ServerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(cfg.listen.port(), 8080);
        assert_eq!(cfg.hub_capacity, 256);
        assert_eq!(cfg.ws, WsLimitsConfig::default());
        assert_eq!(cfg.ws.handshake_timeout, Duration::from_secs(20));
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn reads_overrides() {
        let cfg = ServerConfig::from_lookup(|key| match key {
            "PHANTOMIAS_LISTEN" => Some("127.0.0.1:9000".into()),
            "PHANTOMIAS_HUB_CAPACITY" => Some("8".into()),
            "PHANTOMIAS_WS_RATE_LIMIT" => Some("5".into()),
            "PHANTOMIAS_WS_RATE_WINDOW_SECS" => Some("60".into()),
            "PHANTOMIAS_WS_RATE_EXEMPT_LOOPBACK" => Some("off".into()),
            "PHANTOMIAS_WS_HANDSHAKE_TIMEOUT_SECS" => Some("3".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(cfg.listen, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(cfg.hub_capacity, 8);
        assert_eq!(
            cfg.ws,
            WsLimitsConfig {
                rate_limit: 5,
                rate_window: Duration::from_secs(60),
                exempt_loopback: false,
                handshake_timeout: Duration::from_secs(3),
            }
        );
    }

    #[test]
    fn rejects_bad_listen_address() {
        let err = ServerConfig::from_lookup(|key| {
            (key == "PHANTOMIAS_LISTEN").then(|| "localhost".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PHANTOMIAS_LISTEN"));
    }

    #[test]
    fn rejects_zero_limits() {
        let err = ServerConfig::from_lookup(|key| {
            (key == "PHANTOMIAS_WS_RATE_LIMIT").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PHANTOMIAS_WS_RATE_LIMIT"));

        let err = ServerConfig::from_lookup(|key| {
            (key == "PHANTOMIAS_WS_HANDSHAKE_TIMEOUT_SECS").then(|| "0".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PHANTOMIAS_WS_HANDSHAKE_TIMEOUT_SECS"));
    }

    #[test]
    fn metrics_listener_with_credentials() {
        let cfg = ServerConfig::from_lookup(|key| match key {
            "PHANTOMIAS_METRICS_ENABLED" => Some("true".into()),
            "PHANTOMIAS_METRICS_LISTEN" => Some("127.0.0.1:9100".into()),
            "PHANTOMIAS_METRICS_ENDPOINT" => Some("stats".into()),
            "PHANTOMIAS_METRICS_USER" => Some("ops".into()),
            "PHANTOMIAS_METRICS_PASSWORD" => Some("hunter2".into()),
            _ => None,
        })
        .unwrap();
        let metrics = cfg.metrics.unwrap();
        assert_eq!(metrics.listen, "127.0.0.1:9100".parse().unwrap());
        assert_eq!(metrics.endpoint, "/stats");
        let credentials = metrics.credentials.unwrap();
        assert_eq!(credentials.user, "ops");
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }

    #[test]
    fn metrics_auth_needs_both_halves() {
        let cfg = ServerConfig::from_lookup(|key| match key {
            "PHANTOMIAS_METRICS_ENABLED" => Some("1".into()),
            "PHANTOMIAS_METRICS_USER" => Some("ops".into()),
            _ => None,
        })
        .unwrap();
        let metrics = cfg.metrics.unwrap();
        assert_eq!(metrics, MetricsConfig::default());
    }
}
