//! HTTP route handlers.

pub mod health;

use axum::http::Uri;
use phantomias_shared::ProblemDetails;

use crate::error::ApiError;

/// Fallback for unknown paths.
pub async fn not_found(uri: Uri) -> ApiError {
    ProblemDetails::not_found(format!("no route for {}", uri.path())).into()
}
