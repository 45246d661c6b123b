//! Upstream registry client
//!
//! This crate provides the long-lived HTTP client for the real
//! registry: manifest and blob fetches on cache misses, plus the
//! transparent pass-through for everything the mirror does not
//! recognize.

pub mod client;
pub mod error;

pub use client::{UpstreamClient, UpstreamClientConfig};
pub use error::ProxyError;
