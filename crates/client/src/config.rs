//! Upstream feed configuration from environment variables.

use anyhow::{anyhow, Context};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::Connector;

use crate::ws::{ConnectionOptions, LogFns, WsError};

/// Settings for the upstream notification feed.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket url of the pool backend's notification endpoint.
    pub url: String,
    /// Ping interval and pong deadline; zero disables keep-alive.
    pub keep_alive: Duration,
    /// Pause before retrying after the relay could not be started.
    pub retry_delay: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub reconnect_factor: f64,
    pub handshake_timeout: Duration,
    pub respect_server_closure: bool,
    /// Accept invalid TLS certificates and host names.
    pub ignore_tls: bool,
    /// How long a graceful close may take on shutdown.
    pub shutdown_wait: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            keep_alive: Duration::from_secs(15),
            retry_delay: Duration::from_secs(30),
            reconnect_min: Duration::from_secs(2),
            reconnect_max: Duration::from_secs(30),
            reconnect_factor: 1.5,
            handshake_timeout: Duration::from_secs(2),
            respect_server_closure: false,
            ignore_tls: false,
            shutdown_wait: Duration::from_secs(1),
        }
    }
}

impl UpstreamConfig {
    /// Read the upstream configuration from the environment.
    ///
    /// Environment variables:
    /// - `PHANTOMIAS_UPSTREAM_WS`: upstream url (required)
    /// - `PHANTOMIAS_UPSTREAM_KEEPALIVE_SECS`: keep-alive interval (default: 15)
    /// - `PHANTOMIAS_UPSTREAM_RETRY_SECS`: relay restart delay (default: 30)
    /// - `PHANTOMIAS_UPSTREAM_RECONNECT_MIN_MS` / `_MAX_MS`: backoff bounds (default: 2000 / 30000)
    /// - `PHANTOMIAS_UPSTREAM_RECONNECT_FACTOR`: backoff growth (default: 1.5)
    /// - `PHANTOMIAS_UPSTREAM_HANDSHAKE_TIMEOUT_MS`: dial timeout (default: 2000)
    /// - `PHANTOMIAS_UPSTREAM_RESPECT_CLOSURE`: stop on normal server closure (default: false)
    /// - `PHANTOMIAS_UPSTREAM_IGNORE_TLS`: accept invalid certificates (default: false)
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let defaults = Self::default();

        let url = lookup("PHANTOMIAS_UPSTREAM_WS")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow!("PHANTOMIAS_UPSTREAM_WS must be set"))?;

        Ok(Self {
            url,
            keep_alive: Duration::from_secs(parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_KEEPALIVE_SECS",
                defaults.keep_alive.as_secs(),
            )?),
            retry_delay: Duration::from_secs(parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_RETRY_SECS",
                defaults.retry_delay.as_secs(),
            )?),
            reconnect_min: Duration::from_millis(parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_RECONNECT_MIN_MS",
                defaults.reconnect_min.as_millis() as u64,
            )?),
            reconnect_max: Duration::from_millis(parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_RECONNECT_MAX_MS",
                defaults.reconnect_max.as_millis() as u64,
            )?),
            reconnect_factor: parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_RECONNECT_FACTOR",
                defaults.reconnect_factor,
            )?,
            handshake_timeout: Duration::from_millis(parse_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_HANDSHAKE_TIMEOUT_MS",
                defaults.handshake_timeout.as_millis() as u64,
            )?),
            respect_server_closure: parse_bool_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_RESPECT_CLOSURE",
                defaults.respect_server_closure,
            )?,
            ignore_tls: parse_bool_or(
                &lookup,
                "PHANTOMIAS_UPSTREAM_IGNORE_TLS",
                defaults.ignore_tls,
            )?,
            shutdown_wait: defaults.shutdown_wait,
        })
    }

    /// Connection options for the upstream client, logging through `tracing`
    /// with a `[recws]` tag.
    pub fn connection_options(&self) -> Result<ConnectionOptions, WsError> {
        let mut opts = ConnectionOptions {
            reconnect_interval_min: self.reconnect_min,
            reconnect_interval_max: self.reconnect_max,
            reconnect_interval_factor: self.reconnect_factor,
            respect_server_closure: self.respect_server_closure,
            handshake_timeout: self.handshake_timeout,
            keep_alive_timeout: self.keep_alive,
            log: LogFns {
                debug: Arc::new(|msg| tracing::debug!("[recws] {}", msg)),
                error: Arc::new(|err, msg| tracing::error!("[recws] {}: {}", msg, err)),
            },
            ..ConnectionOptions::default()
        };

        if self.ignore_tls {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()?;
            opts.tls_connector = Some(Connector::NativeTls(tls));
        }

        Ok(opts)
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, raw)),
        _ => Ok(default),
    }
}

fn parse_bool_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> anyhow::Result<bool> {
    match lookup(key).map(|v| v.trim().to_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("invalid value for {}: {:?}", key, v)),
        },
    }
}
