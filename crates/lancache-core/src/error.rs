//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Store error: {0}")]
    Store(#[from] lancache_store::StoreError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] lancache_proxy::ProxyError),
}
