//! Cache hit/miss orchestration

use bytes::Bytes;
use lancache_proxy::UpstreamClient;
use lancache_store::{ByteStream, Manifest, ManifestKey, Store, StoreError, compute_sha256};
use std::sync::Arc;
use tokio::fs::File;
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::tee::tee_to_store;

/// A manifest served from the cache
#[derive(Debug, Clone)]
pub struct CachedManifest {
    /// Verbatim bytes as received from upstream
    pub bytes: Bytes,
    /// Media type declared by the manifest (or the Docker v2 default)
    pub media_type: String,
    /// Real digest of `bytes`, suitable for `Docker-Content-Digest`
    pub digest: String,
}

/// Mirror service wiring the store to the upstream registry.
///
/// Holds no locks; safe to share across request workers.
pub struct MirrorService {
    store: Arc<Store>,
    upstream: Arc<UpstreamClient>,
    registry: String,
}

impl MirrorService {
    /// Create a new mirror service.
    ///
    /// `registry` is the intercepted hostname, used as the fixed
    /// registry field of every cache key.
    pub fn new(store: Arc<Store>, upstream: Arc<UpstreamClient>, registry: String) -> Self {
        Self {
            store,
            upstream,
            registry,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn upstream(&self) -> &Arc<UpstreamClient> {
        &self.upstream
    }

    /// Cache key for a tagged manifest
    pub fn manifest_key(&self, namespace: &str, repo: &str, tag: &str) -> ManifestKey {
        ManifestKey::new(self.registry.clone(), namespace, repo, tag)
    }

    /// Look up a cached manifest.
    ///
    /// `NotFound` is a miss; a corrupt stored manifest is also treated
    /// as a miss so the next fetch repairs it (the file stays on disk
    /// for inspection).
    pub async fn manifest_hit(
        &self,
        namespace: &str,
        repo: &str,
        reference: &str,
    ) -> Result<Option<CachedManifest>, CoreError> {
        let key = self.manifest_key(namespace, repo, reference);
        let bytes = match self.store.manifest_bytes(&key).await {
            Ok(bytes) => bytes,
            Err(StoreError::NotFound(_)) => {
                metrics::counter!("lancache_cache_misses_total").increment(1);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        let manifest: Manifest = match serde_json::from_slice(&bytes) {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Cached manifest for {} is corrupt, refetching: {}", key, e);
                metrics::counter!("lancache_cache_misses_total").increment(1);
                return Ok(None);
            }
        };

        metrics::counter!("lancache_cache_hits_total").increment(1);
        debug!("Manifest cache hit: {}", key);

        Ok(Some(CachedManifest {
            digest: compute_sha256(&bytes),
            media_type: manifest.media_type().to_string(),
            bytes,
        }))
    }

    /// Cache a manifest fetched from upstream.
    ///
    /// Parse failures are logged and skipped; the response has already
    /// been mirrored to the client, only caching is lost.
    pub async fn cache_manifest(&self, namespace: &str, repo: &str, reference: &str, bytes: Bytes) {
        let key = self.manifest_key(namespace, repo, reference);
        match self.store.store_manifest(&key, bytes).await {
            Ok(_) => debug!("Cached manifest {}", key),
            Err(StoreError::Corrupt { reason, .. }) => {
                warn!("Upstream manifest for {} not cacheable: {}", key, reason);
            }
            Err(e) => warn!("Failed to cache manifest {}: {}", key, e),
        }
    }

    /// Look up a cached blob, returning an open handle and its size
    pub async fn blob_hit(&self, digest: &str) -> Result<Option<(File, u64)>, CoreError> {
        match self.store.open_blob(digest).await {
            Ok(pair) => {
                metrics::counter!("lancache_cache_hits_total").increment(1);
                debug!("Blob cache hit: {}", digest);
                Ok(Some(pair))
            }
            Err(StoreError::NotFound(_)) => {
                metrics::counter!("lancache_cache_misses_total").increment(1);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Tee an upstream blob body to the client and into the store.
    ///
    /// Concurrent misses for the same digest each run their own tee;
    /// the store's atomic rename makes the race harmless (last commit
    /// wins, bytes identical).
    pub fn tee_blob(
        &self,
        digest: &str,
        source: ByteStream,
    ) -> (
        ByteStream,
        tokio::task::JoinHandle<Result<u64, StoreError>>,
    ) {
        tee_to_store(self.store.clone(), digest, source)
    }
}
