//! Registry v2 HTTP front-end
//!
//! This crate provides the axum router for the mirror: the Registry
//! v2 endpoints clients pull from, cache hit serving with range and
//! conditional request support, transparent pass-through for
//! everything else, and the health/stats/metrics side endpoints.

pub mod error;
pub mod range;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
