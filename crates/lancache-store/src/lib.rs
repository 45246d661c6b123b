//! Content-addressed model cache
//!
//! This crate persists registry blobs and manifests on the local
//! filesystem: blobs keyed by their sha256 digest, manifests keyed by
//! `(registry, namespace, repo, tag)`. All writes are staged to a
//! uniquely-named temp file and renamed into place.

pub mod digest;
pub mod error;
pub mod manifest;
pub mod store;

pub use digest::{compute_sha256, parse_digest, validate_digest};
pub use error::StoreError;
pub use manifest::{Descriptor, Manifest, ManifestKey, MANIFEST_MEDIA_TYPE};
pub use store::{ByteStream, Store, StoreStats};
