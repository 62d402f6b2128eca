//! Prometheus metrics, served on a listener of their own.

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use phantomias_shared::metrics::{
    BROADCASTS_TOTAL, SUBSCRIBERS, SUBSCRIBERS_TOTAL, UPSTREAM_RECONNECTS_TOTAL,
    WS_RATE_LIMITED_TOTAL,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::config::{BasicCredentials, MetricsConfig};

/// Installs the process-wide Prometheus recorder.
pub fn install() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

fn describe() {
    describe_gauge!(SUBSCRIBERS, "Subscribers currently registered with the hub");
    describe_counter!(SUBSCRIBERS_TOTAL, "Subscribers registered since start");
    describe_counter!(BROADCASTS_TOTAL, "Notifications fanned out to subscribers");
    describe_counter!(
        UPSTREAM_RECONNECTS_TOTAL,
        "Upstream connections re-established after a drop"
    );
    describe_counter!(
        WS_RATE_LIMITED_TOTAL,
        "WebSocket upgrades refused by the per-address limit"
    );
}

/// Router exposing `handle` at the configured endpoint, behind basic auth
/// when credentials are configured.
pub fn router(handle: PrometheusHandle, config: &MetricsConfig) -> Router {
    let router = Router::new()
        .route(&config.endpoint, get(render))
        .with_state(handle);

    match &config.credentials {
        Some(credentials) => router.layer(middleware::from_fn_with_state(
            Arc::new(credentials.clone()),
            basic_auth,
        )),
        None => router,
    }
}

/// Serves the metrics router until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    app: Router,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn render(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

async fn basic_auth(
    State(credentials): State<Arc<BasicCredentials>>,
    request: Request,
    next: Next,
) -> Response {
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Basic "))
        .and_then(|encoded| STANDARD.decode(encoded.trim()).ok())
        .and_then(|raw| String::from_utf8(raw).ok())
        .is_some_and(|pair| {
            pair.split_once(':')
                == Some((credentials.user.as_str(), credentials.password.as_str()))
        });

    if authorized {
        next.run(request).await
    } else {
        (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"metrics\"")],
        )
            .into_response()
    }
}
