//! Phantomias - notification relay for the pool API.
//!
//! Connects to the pool backend's notification feed and rebroadcasts every
//! message to WebSocket clients on `/v1/ws`. Prometheus metrics are served
//! on a second listener when enabled.

use anyhow::Context;
use phantomias_client::{UpstreamConfig, UpstreamRelay};
use phantomias_server::{router, telemetry, AppState, RelayHub, ServerConfig, WsLimits};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "phantomias=debug,phantomias_server=debug,phantomias_client=debug,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let server_config = ServerConfig::from_env()?;
    let upstream_config = UpstreamConfig::from_env()?;

    let shutdown = CancellationToken::new();

    let metrics_task = match &server_config.metrics {
        Some(metrics) => {
            let handle = telemetry::install().context("failed to install metrics recorder")?;
            let listener = tokio::net::TcpListener::bind(metrics.listen)
                .await
                .with_context(|| format!("failed to bind {}", metrics.listen))?;
            tracing::info!(
                "Serving metrics on {}{}{}",
                metrics.listen,
                metrics.endpoint,
                if metrics.credentials.is_some() {
                    " (basic auth)"
                } else {
                    ""
                }
            );
            Some(tokio::spawn(telemetry::serve(
                listener,
                telemetry::router(handle, metrics),
                shutdown.clone(),
            )))
        }
        None => None,
    };

    let (hub, hub_task) = RelayHub::spawn(server_config.hub_capacity, shutdown.clone());

    let relay = Arc::new(UpstreamRelay::new(upstream_config, hub.broadcast_sender()));
    let relay_task = tokio::spawn({
        let relay = relay.clone();
        let cancel = shutdown.clone();
        async move { relay.run(cancel).await }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Shutdown requested");
                    shutdown.cancel();
                }
                Err(e) => tracing::error!("Failed to listen for ctrl-c: {}", e),
            }
        }
    });

    let state = AppState::new(hub, relay.status(), shutdown.clone())
        .with_ws_limits(WsLimits::new(&server_config.ws));
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(server_config.listen)
        .await
        .with_context(|| format!("failed to bind {}", server_config.listen))?;
    tracing::info!("Starting server on {}", server_config.listen);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    })
    .await
    .context("server error")?;

    // The server can also stop on its own; take the rest down with it.
    shutdown.cancel();
    relay_task.await.context("upstream relay task failed")?;
    hub_task.await.context("relay hub task failed")?;
    if let Some(task) = metrics_task {
        task.await
            .context("metrics task failed")?
            .context("metrics server error")?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
