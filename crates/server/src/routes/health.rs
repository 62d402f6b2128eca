//! Liveness report for load balancers and operators.

use axum::{extract::State, Json};
use phantomias_shared::{HealthReport, ProblemDetails};

use crate::error::ApiError;
use crate::state::AppState;

/// Upstream state and subscriber count. Fails with 503 once the hub has stopped.
pub async fn health(State(state): State<AppState>) -> Result<Json<HealthReport>, ApiError> {
    let subscribers = state.hub.subscriber_count().await.map_err(|e| {
        tracing::error!("health check failed: {}", e);
        ApiError::from(ProblemDetails::service_unavailable(e.to_string()))
    })?;

    Ok(Json(HealthReport::new(state.upstream_state(), subscribers)))
}
