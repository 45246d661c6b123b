//! Proxy error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid upstream URL: {0}")]
    InvalidUrl(String),
}
