use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;
use std::time::Duration;

use crate::algorithms::RateLimiter;
use crate::health::HealthChecker;
use crate::response::ApiResponse;

/// Shared application state
pub type SharedState = Arc<AppState>;

/// Everything a request handler or the admission middleware needs.
pub struct AppState {
    pub limiter: Arc<dyn RateLimiter>,
    pub health: HealthChecker,
    pub instance_id: String,
    /// Bucket capacity, echoed in `X-RateLimit-Limit`.
    pub capacity: u64,
    /// Deadline for one `check_limit` call.
    pub store_timeout: Duration,
    /// Admit requests whose check failed instead of rejecting them.
    pub fail_open: bool,
}

/// Rate limited endpoint
pub async fn api_handler(State(state): State<SharedState>) -> impl IntoResponse {
    Json(ApiResponse::hit(&state.instance_id))
}

/// Health check endpoint
pub async fn health_check(State(state): State<SharedState>) -> impl IntoResponse {
    let status = state.health.check_health().await;
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}
