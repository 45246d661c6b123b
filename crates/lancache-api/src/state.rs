//! Application state

use lancache_core::MirrorService;
use std::sync::Arc;

/// Type alias for the Prometheus metrics handle
pub type MetricsHandle = metrics_exporter_prometheus::PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<MirrorService>,
}

impl AppState {
    pub fn new(service: Arc<MirrorService>) -> Self {
        Self { service }
    }
}
