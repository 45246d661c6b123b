//! Filesystem-backed content-addressed store

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::digest::validate_digest;
use crate::error::StoreError;
use crate::manifest::{Manifest, ManifestKey};

/// Type alias for a boxed stream of bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StoreError>> + Send>>;

/// Suffix used by in-flight staging files, skipped by stats and reads
const STAGING_SUFFIX: &str = ".tmp";

/// Store statistics, served on `/cache/stats`
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub blob_count: u64,
    pub manifest_count: u64,
    pub total_blob_bytes: u64,
    pub cache_directory: String,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Content-addressed persistent cache of blobs and manifests.
///
/// Layout under the root directory:
/// - `blobs/sha256-<hex>` (digest with `:` escaped to `-`)
/// - `manifests/<registry>/<namespace>/<repo>/<tag>`
///
/// The store owns the root directory exclusively for the process
/// lifetime. Every write stages into a uniquely-named `.tmp` file in
/// the destination directory and renames it into place, so readers
/// never observe a partial object and racing writers of the same blob
/// both succeed (last rename wins, bytes identical).
pub struct Store {
    root: PathBuf,
    blobs: PathBuf,
    manifests: PathBuf,
}

impl Store {
    /// Open (creating if needed) a store rooted at `root`
    pub async fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        let blobs = root.join("blobs");
        let manifests = root.join("manifests");

        fs::create_dir_all(&blobs).await?;
        fs::create_dir_all(&manifests).await?;

        info!("Initialized cache store at {:?}", root);

        Ok(Self {
            root,
            blobs,
            manifests,
        })
    }

    /// The configured cache root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the file path for a blob digest
    fn blob_path(&self, digest: &str) -> Result<PathBuf, StoreError> {
        validate_digest(digest)?;
        Ok(self.blobs.join(digest.replace(':', "-")))
    }

    /// Get the file path for a manifest key
    fn manifest_path(&self, key: &ManifestKey) -> PathBuf {
        self.manifests
            .join(escape_component(&key.registry))
            .join(escape_component(&key.namespace))
            .join(escape_component(&key.repo))
            .join(escape_component(&key.tag))
    }

    /// A uniquely-named sibling staging path for an atomic write
    fn staging_path(target: &Path) -> PathBuf {
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        target.with_file_name(format!("{}.{}{}", name, Uuid::new_v4(), STAGING_SUFFIX))
    }

    // ==================== Blobs ====================

    /// Check if a blob exists
    pub async fn has_blob(&self, digest: &str) -> Result<bool, StoreError> {
        let path = self.blob_path(digest)?;
        Ok(fs::try_exists(&path).await?)
    }

    /// Get the size of a blob
    pub async fn blob_size(&self, digest: &str) -> Result<u64, StoreError> {
        let path = self.blob_path(digest)?;
        let metadata = fs::metadata(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(digest.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(metadata.len())
    }

    /// Open a blob for reading, returning the file handle and its size.
    ///
    /// The handle is positioned at the start; callers doing range reads
    /// seek it themselves. Concurrent readers are fine, each gets an
    /// independent handle.
    pub async fn open_blob(&self, digest: &str) -> Result<(File, u64), StoreError> {
        let path = self.blob_path(digest)?;
        let file = File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(digest.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;
        let size = file.metadata().await?.len();
        Ok((file, size))
    }

    /// Stream a blob from the start
    pub async fn blob_stream(&self, digest: &str) -> Result<(ByteStream, u64), StoreError> {
        let (file, size) = self.open_blob(digest).await?;
        debug!("Streaming blob {} ({} bytes)", digest, size);

        let reader = BufReader::new(file);
        let stream = tokio_util::io::ReaderStream::new(reader);
        let stream: ByteStream = Box::pin(stream.map(|result| result.map_err(StoreError::Io)));
        Ok((stream, size))
    }

    /// Store a blob from a stream, verifying its digest before commit.
    ///
    /// The stream is consumed to EOF into a staging file while hashing.
    /// If the computed digest does not equal `digest` the staging file
    /// is deleted and `DigestMismatch` is returned; the final name is
    /// never created. Returns the committed size.
    pub async fn store_blob(
        &self,
        digest: &str,
        mut stream: ByteStream,
    ) -> Result<u64, StoreError> {
        let path = self.blob_path(digest)?;
        let staging = Self::staging_path(&path);

        debug!("Storing blob {} via {:?}", digest, staging);

        let mut file = File::create(&staging).await?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    // Source failed mid-stream; nothing to commit.
                    drop(file);
                    let _ = fs::remove_file(&staging).await;
                    return Err(e);
                }
            };
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.flush().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != digest {
            let _ = fs::remove_file(&staging).await;
            return Err(StoreError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed,
            });
        }

        fs::rename(&staging, &path).await?;

        debug!("Committed blob {} ({} bytes)", digest, written);
        Ok(written)
    }

    /// Store an in-memory blob, verifying its digest before commit
    pub async fn store_blob_bytes(&self, digest: &str, data: Bytes) -> Result<u64, StoreError> {
        let stream: ByteStream = Box::pin(futures::stream::iter([Ok(data)]));
        self.store_blob(digest, stream).await
    }

    // ==================== Manifests ====================

    /// Check if a manifest exists for the key
    pub async fn has_manifest(&self, key: &ManifestKey) -> Result<bool, StoreError> {
        Ok(fs::try_exists(self.manifest_path(key)).await?)
    }

    /// Read the verbatim manifest bytes for the key
    pub async fn manifest_bytes(&self, key: &ManifestKey) -> Result<Bytes, StoreError> {
        let path = self.manifest_path(key);
        let data = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StoreError::NotFound(key.to_string())
            } else {
                StoreError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    /// Read and parse the manifest for the key.
    ///
    /// Unparseable JSON returns `Corrupt` and leaves the file in place
    /// for operator inspection.
    pub async fn get_manifest(&self, key: &ManifestKey) -> Result<Manifest, StoreError> {
        let data = self.manifest_bytes(key).await?;
        serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
            path: self.manifest_path(key).to_string_lossy().into_owned(),
            reason: e.to_string(),
        })
    }

    /// Store a manifest verbatim under the key, overwriting any
    /// previous version.
    ///
    /// The bytes must parse as a manifest; the parsed form is returned
    /// but the file content is exactly `data`.
    pub async fn store_manifest(
        &self,
        key: &ManifestKey,
        data: Bytes,
    ) -> Result<Manifest, StoreError> {
        let manifest: Manifest =
            serde_json::from_slice(&data).map_err(|e| StoreError::Corrupt {
                path: key.to_string(),
                reason: e.to_string(),
            })?;

        let path = self.manifest_path(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let staging = Self::staging_path(&path);
        let mut file = File::create(&staging).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&staging, &path).await?;

        debug!("Stored manifest {} ({} bytes)", key, data.len());
        Ok(manifest)
    }

    // ==================== Maintenance ====================

    /// Collect store statistics by walking the cache directories
    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut blob_count = 0u64;
        let mut total_blob_bytes = 0u64;
        let mut last_updated: Option<DateTime<Utc>> = None;

        let mut entries = fs::read_dir(&self.blobs).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                continue;
            }
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            blob_count += 1;
            total_blob_bytes += metadata.len();
            track_mtime(&mut last_updated, &metadata);
        }

        let mut manifest_count = 0u64;
        // Fixed depth: manifests/<registry>/<namespace>/<repo>/<tag>
        let mut registries = fs::read_dir(&self.manifests).await?;
        while let Some(registry) = registries.next_entry().await? {
            if !registry.metadata().await?.is_dir() {
                continue;
            }
            let mut namespaces = fs::read_dir(registry.path()).await?;
            while let Some(namespace) = namespaces.next_entry().await? {
                if !namespace.metadata().await?.is_dir() {
                    continue;
                }
                let mut repos = fs::read_dir(namespace.path()).await?;
                while let Some(repo) = repos.next_entry().await? {
                    if !repo.metadata().await?.is_dir() {
                        continue;
                    }
                    let mut tags = fs::read_dir(repo.path()).await?;
                    while let Some(tag) = tags.next_entry().await? {
                        let name = tag.file_name();
                        if name.to_string_lossy().ends_with(STAGING_SUFFIX) {
                            continue;
                        }
                        let metadata = tag.metadata().await?;
                        if metadata.is_file() {
                            manifest_count += 1;
                            track_mtime(&mut last_updated, &metadata);
                        }
                    }
                }
            }
        }

        Ok(StoreStats {
            blob_count,
            manifest_count,
            total_blob_bytes,
            cache_directory: self.root.to_string_lossy().into_owned(),
            last_updated,
        })
    }

    /// Remove all persisted state, returning `(blobs, manifests)` removed
    pub async fn clear(&self) -> Result<(u64, u64), StoreError> {
        let stats = self.stats().await?;
        info!(
            "Clearing cache: {} blobs, {} manifests",
            stats.blob_count, stats.manifest_count
        );

        if let Err(e) = fs::remove_dir_all(&self.blobs).await {
            warn!("Failed to remove blob directory: {}", e);
        }
        if let Err(e) = fs::remove_dir_all(&self.manifests).await {
            warn!("Failed to remove manifest directory: {}", e);
        }
        fs::create_dir_all(&self.blobs).await?;
        fs::create_dir_all(&self.manifests).await?;

        Ok((stats.blob_count, stats.manifest_count))
    }
}

fn track_mtime(latest: &mut Option<DateTime<Utc>>, metadata: &std::fs::Metadata) {
    if let Ok(modified) = metadata.modified() {
        let modified: DateTime<Utc> = modified.into();
        if latest.map(|current| modified > current).unwrap_or(true) {
            *latest = Some(modified);
        }
    }
}

/// Escape one manifest-key component for use as a path segment.
///
/// Bytes outside `[A-Za-z0-9._-]`, plus any leading dot, are encoded
/// as `%XX`. The mapping is injective: `%` itself is never in the safe
/// set, so distinct keys never collide, and `.`/`..` cannot appear.
fn escape_component(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for (i, b) in component.bytes().enumerate() {
        let safe = matches!(b, b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'_' | b'-')
            || (b == b'.' && i != 0);
        if safe {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}
