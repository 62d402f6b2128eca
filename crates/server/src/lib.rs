//! Phantomias server
//!
//! The downstream side of the notification relay: a [`hub::RelayHub`] that fans
//! upstream notifications out to WebSocket subscribers, and the axum router
//! that upgrades them. Prometheus metrics are served separately by
//! [`telemetry`].

pub mod config;
pub mod error;
pub mod hub;
pub mod limit;
pub mod routes;
pub mod state;
pub mod telemetry;
pub mod ws;

use axum::{middleware, routing::get, Router};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{MetricsConfig, ServerConfig, WsLimitsConfig};
pub use hub::{HubError, HubLoop, RelayHub, SinkError, Subscriber, SubscriberSink};
pub use limit::WsLimits;
pub use state::AppState;

/// Builds the HTTP router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`; the WebSocket
/// route reads the peer address, and only admits it within [`WsLimits`].
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route(
            "/v1/ws",
            get(ws::ws_handler).route_layer(middleware::from_fn_with_state(
                state.ws_limits.clone(),
                limit::guard_upgrade,
            )),
        )
        .route("/health", get(routes::health::health))
        .fallback(routes::not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
