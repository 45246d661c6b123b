//! Health check endpoint

use axum::{Json, Router, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::state::AppState;

/// Health status response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub time: DateTime<Utc>,
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    metrics::counter!("lancache_health_checks_total").increment(1);

    Json(HealthResponse {
        status: "healthy".to_string(),
        time: Utc::now(),
    })
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new().route("/health", get(health))
}
