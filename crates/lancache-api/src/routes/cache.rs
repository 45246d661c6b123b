//! Cache stats and maintenance endpoints

use axum::{
    Json, Router,
    extract::State,
    routing::{get, post},
};
use lancache_store::StoreStats;
use serde::Serialize;
use tracing::info;

use crate::error::ApiError;
use crate::state::AppState;

/// Response for POST /cache/clear
#[derive(Serialize)]
pub struct ClearResponse {
    pub cleared_blobs: u64,
    pub cleared_manifests: u64,
}

/// GET /cache/stats
async fn stats(State(state): State<AppState>) -> Result<Json<StoreStats>, ApiError> {
    Ok(Json(state.service.store().stats().await?))
}

/// POST /cache/clear - remove all cached blobs and manifests
async fn clear(State(state): State<AppState>) -> Result<Json<ClearResponse>, ApiError> {
    let (cleared_blobs, cleared_manifests) = state.service.store().clear().await?;
    info!(
        "Cache cleared: {} blobs, {} manifests",
        cleared_blobs, cleared_manifests
    );
    Ok(Json(ClearResponse {
        cleared_blobs,
        cleared_manifests,
    }))
}

/// Create cache routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/cache/stats", get(stats))
        .route("/cache/clear", post(clear))
}
