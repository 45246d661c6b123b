//! Mirror orchestration
//!
//! This crate sits between the HTTP front-end and the store: cache
//! hit/miss decisions for manifests and blobs, and the bounded
//! streaming tee that feeds a cache miss to the client and the store
//! at the same time.

pub mod error;
pub mod service;
pub mod tee;

pub use error::CoreError;
pub use service::{CachedManifest, MirrorService};
pub use tee::tee_to_store;
