//! API routes

mod cache;
mod health;
mod metrics;
mod passthrough;
mod registry;

use axum::Router;
use std::sync::Arc;

use crate::state::{AppState, MetricsHandle};

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let mut router = Router::new()
        // Health check
        .merge(health::routes())
        // Cache maintenance endpoints
        .merge(cache::routes())
        // Registry v2 mirror
        .merge(registry::routes())
        // Anything unrecognized goes straight to upstream
        .fallback(passthrough::passthrough)
        .with_state(state);

    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle));
    }
    router
}
