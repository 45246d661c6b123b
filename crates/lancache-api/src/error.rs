//! API error types

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Core error: {0}")]
    Core(#[from] lancache_core::CoreError),

    #[error("Store error: {0}")]
    Store(#[from] lancache_store::StoreError),

    #[error("Upstream error: {0}")]
    Proxy(#[from] lancache_proxy::ProxyError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone()),
            ApiError::Core(e) => match e {
                lancache_core::CoreError::Proxy(_) => (
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_UNAVAILABLE",
                    "Upstream registry unavailable".to_string(),
                ),
                // Local cache failure; details stay in the logs.
                lancache_core::CoreError::Store(_) => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CACHE_ERROR",
                    "Cache failure".to_string(),
                ),
            },
            ApiError::Store(e) => match e {
                lancache_store::StoreError::NotFound(msg) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", msg.clone())
                }
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "CACHE_ERROR",
                    "Cache failure".to_string(),
                ),
            },
            ApiError::Proxy(_) => (
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                "Upstream registry unavailable".to_string(),
            ),
        };

        if status.is_server_error() {
            tracing::warn!("Request failed with {}: {}", status, self);
        }

        // OCI Distribution spec error format
        let body = axum::Json(json!({
            "errors": [{
                "code": code,
                "message": message,
                "detail": null
            }]
        }));

        (status, body).into_response()
    }
}
