//! Manifest model and cache key

use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type served for manifests that do not declare their own
pub const MANIFEST_MEDIA_TYPE: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// A content descriptor: one layer or config entry of a manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub digest: String,
    pub size: u64,
}

/// A model manifest: ordered layers plus a config descriptor.
///
/// Manifests are persisted verbatim as received from upstream; this
/// parsed form exists for validation and structured access, never for
/// re-serialization back to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// The media type to serve this manifest under
    pub fn media_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(MANIFEST_MEDIA_TYPE)
    }
}

/// Key identifying one tagged manifest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey {
    /// Upstream registry hostname (e.g. "registry.ollama.ai")
    pub registry: String,
    /// Path namespace, conventionally "library" for unscoped names
    pub namespace: String,
    /// Model name
    pub repo: String,
    /// Opaque version label
    pub tag: String,
}

impl ManifestKey {
    pub fn new(
        registry: impl Into<String>,
        namespace: impl Into<String>,
        repo: impl Into<String>,
        tag: impl Into<String>,
    ) -> Self {
        Self {
            registry: registry.into(),
            namespace: namespace.into(),
            repo: repo.into(),
            tag: tag.into(),
        }
    }
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.registry, self.namespace, self.repo, self.tag
        )
    }
}
