//! Registry v2 mirror routes

use axum::{
    Router,
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::Response,
    routing::{any, get},
};
use futures::TryStreamExt;
use lancache_store::{ByteStream, StoreError, validate_digest};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

use super::passthrough::{copy_response_headers, mirror_response, passthrough};
use crate::error::ApiError;
use crate::range::{RangeOutcome, blob_etag, evaluate_range, if_none_match_matches};
use crate::state::AppState;

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const DIGEST_HEADER: &str = "docker-content-digest";
const OCTET_STREAM: &str = "application/octet-stream";
/// Read size for streaming cached blobs off disk
const BLOB_CHUNK: usize = 64 * 1024;

/// Create registry routes
pub fn routes() -> Router<AppState> {
    Router::new()
        // Version check
        .route("/v2/", get(version_probe))
        // Everything under /v2/ shares one dispatcher so unrecognized
        // shapes and methods fall through to upstream
        .route("/v2/{*path}", any(dispatch))
}

// ==================== Version Check ====================

/// GET /v2/ - how Registry v2 clients confirm the protocol
async fn version_probe() -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .header(API_VERSION_HEADER, "registry/2.0")
        .body(Body::from("{}"))
        .expect("static response parts are valid")
}

// ==================== Classification ====================

enum RegistryRequest {
    Manifest {
        namespace: String,
        repo: String,
        reference: String,
    },
    Blob {
        namespace: String,
        repo: String,
        digest: String,
    },
}

/// Classify a path under `/v2/`.
///
/// Anchored shapes only: `{namespace}/{repo}/manifests/{reference}`
/// and `{namespace}/{repo}/blobs/sha256:<64 lowercase hex>`. A blobs
/// path with any other digest form is not a blob request and returns
/// `None` for pass-through.
fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    let segments: Vec<&str> = path.split('/').collect();
    if segments.len() != 4 || segments.iter().any(|s| s.is_empty()) {
        return None;
    }

    let (namespace, repo) = (segments[0].to_string(), segments[1].to_string());
    match segments[2] {
        "manifests" => Some(RegistryRequest::Manifest {
            namespace,
            repo,
            reference: segments[3].to_string(),
        }),
        "blobs" if validate_digest(segments[3]).is_ok() => Some(RegistryRequest::Blob {
            namespace,
            repo,
            digest: segments[3].to_string(),
        }),
        _ => None,
    }
}

// ==================== Dispatch ====================

async fn dispatch(State(state): State<AppState>, request: Request) -> Result<Response, ApiError> {
    let rest = request
        .uri()
        .path()
        .strip_prefix("/v2/")
        .unwrap_or_default()
        .to_string();
    let method = request.method().clone();
    let is_read = method == Method::GET || method == Method::HEAD;

    match parse_registry_path(&rest) {
        Some(RegistryRequest::Manifest {
            namespace,
            repo,
            reference,
        }) if is_read => {
            if let Some(cached) = state
                .service
                .manifest_hit(&namespace, &repo, &reference)
                .await?
            {
                return serve_cached_manifest(&method, cached);
            }
            if method == Method::GET {
                return fetch_and_cache_manifest(
                    &state,
                    request.headers(),
                    &namespace,
                    &repo,
                    &reference,
                )
                .await;
            }
            // HEAD miss: probe upstream without caching
            passthrough(State(state), request).await
        }
        Some(RegistryRequest::Blob {
            namespace,
            repo,
            digest,
        }) if is_read => {
            if let Some((file, size)) = state.service.blob_hit(&digest).await? {
                return serve_cached_blob(&method, request.headers(), &digest, file, size).await;
            }
            if method == Method::GET {
                return fetch_and_tee_blob(&state, &namespace, &repo, &digest).await;
            }
            passthrough(State(state), request).await
        }
        // Unrecognized shape or non-read method
        _ => passthrough(State(state), request).await,
    }
}

// ==================== Manifests ====================

fn serve_cached_manifest(
    method: &Method,
    cached: lancache_core::CachedManifest,
) -> Result<Response, ApiError> {
    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, cached.media_type.as_str())
        .header(header::CONTENT_LENGTH, cached.bytes.len())
        .header(DIGEST_HEADER, cached.digest.as_str());

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from(cached.bytes)
    };
    Ok(builder.body(body).expect("manifest response parts are valid"))
}

/// Manifest miss: mirror upstream's answer and cache it on 200.
///
/// The client's headers travel upstream; the body comes back buffered
/// (manifests are small) so it can be both returned and stored.
async fn fetch_and_cache_manifest(
    state: &AppState,
    client_headers: &HeaderMap,
    namespace: &str,
    repo: &str,
    reference: &str,
) -> Result<Response, ApiError> {
    let upstream = state
        .service
        .upstream()
        .fetch_manifest(namespace, repo, reference, client_headers)
        .await?;

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let body = upstream
        .bytes()
        .await
        .map_err(lancache_proxy::ProxyError::Http)?;

    if status == StatusCode::OK {
        state
            .service
            .cache_manifest(namespace, repo, reference, body.clone())
            .await;
    } else {
        debug!(
            "Upstream returned {} for manifest {}/{}:{}, not caching",
            status, namespace, repo, reference
        );
    }

    let builder = copy_response_headers(Response::builder().status(status), &response_headers);
    Ok(builder
        .body(Body::from(body))
        .expect("mirrored manifest parts are valid"))
}

// ==================== Blobs ====================

/// Serve a cached blob, honoring Range, If-Range, and If-None-Match
async fn serve_cached_blob(
    method: &Method,
    headers: &HeaderMap,
    digest: &str,
    mut file: File,
    size: u64,
) -> Result<Response, ApiError> {
    let etag = blob_etag(digest);

    if let Some(candidates) = headers
        .get(header::IF_NONE_MATCH)
        .and_then(|v| v.to_str().ok())
        && if_none_match_matches(candidates, &etag)
    {
        return Ok(Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(header::ETAG, etag.as_str())
            .header(DIGEST_HEADER, digest)
            .body(Body::empty())
            .expect("304 response parts are valid"));
    }

    // An If-Range validator that is not our ETag downgrades any Range
    // to the full body.
    let range_applies = match headers.get(header::IF_RANGE).and_then(|v| v.to_str().ok()) {
        Some(validator) => validator == etag,
        None => true,
    };

    if let Some(range_header) = headers.get(header::RANGE).and_then(|v| v.to_str().ok())
        && range_applies
    {
        match evaluate_range(range_header, size) {
            RangeOutcome::Partial(range) => {
                let builder = Response::builder()
                    .status(StatusCode::PARTIAL_CONTENT)
                    .header(header::CONTENT_TYPE, OCTET_STREAM)
                    .header(
                        header::CONTENT_RANGE,
                        format!("bytes {}-{}/{}", range.start, range.end, size),
                    )
                    .header(header::CONTENT_LENGTH, range.len())
                    .header(header::ACCEPT_RANGES, "bytes")
                    .header(header::ETAG, etag.as_str())
                    .header(DIGEST_HEADER, digest);

                let body = if method == Method::HEAD {
                    Body::empty()
                } else {
                    file.seek(SeekFrom::Start(range.start))
                        .await
                        .map_err(StoreError::Io)?;
                    let limited = file.take(range.len());
                    Body::from_stream(ReaderStream::with_capacity(limited, BLOB_CHUNK))
                };
                return Ok(builder.body(body).expect("206 response parts are valid"));
            }
            RangeOutcome::Unsatisfiable => {
                return Ok(Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .header(header::CONTENT_RANGE, format!("bytes */{}", size))
                    .body(Body::empty())
                    .expect("416 response parts are valid"));
            }
            RangeOutcome::Ignored => {}
        }
    }

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OCTET_STREAM)
        .header(header::CONTENT_LENGTH, size)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::ETAG, etag.as_str())
        .header(DIGEST_HEADER, digest);

    let body = if method == Method::HEAD {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::with_capacity(file, BLOB_CHUNK))
    };
    Ok(builder.body(body).expect("blob response parts are valid"))
}

/// Blob miss: stream upstream's body to the client while tee-ing it
/// into the store.
///
/// Non-200 upstream answers are mirrored verbatim and never cached.
/// The client's Range (if any) is not forwarded; the whole blob is
/// fetched so the cache entry is complete.
async fn fetch_and_tee_blob(
    state: &AppState,
    namespace: &str,
    repo: &str,
    digest: &str,
) -> Result<Response, ApiError> {
    let upstream = state
        .service
        .upstream()
        .fetch_blob(namespace, repo, digest)
        .await?;

    if upstream.status() != StatusCode::OK {
        debug!(
            "Upstream returned {} for blob {}, mirroring without caching",
            upstream.status(),
            digest
        );
        return Ok(mirror_response(upstream));
    }

    let declared_len = upstream.content_length();
    let source: ByteStream = Box::pin(
        upstream
            .bytes_stream()
            .map_err(|e| StoreError::Io(std::io::Error::other(e))),
    );
    let (client_stream, cache_handle) = state.service.tee_blob(digest, source);

    // Surface the cache write's outcome in the logs without blocking
    // the response on it.
    let digest_owned = digest.to_string();
    tokio::spawn(async move {
        match cache_handle.await {
            Ok(Ok(size)) => debug!("Cached blob {} ({} bytes)", digest_owned, size),
            Ok(Err(e)) => warn!("Cache write for {} failed: {}", digest_owned, e),
            Err(e) => warn!("Cache write task for {} panicked: {:?}", digest_owned, e),
        }
    });

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, OCTET_STREAM)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(DIGEST_HEADER, digest);
    if let Some(len) = declared_len {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    Ok(builder
        .body(Body::from_stream(client_stream))
        .expect("teed blob response parts are valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routes::create_router;
    use crate::state::AppState;
    use axum::body::to_bytes;
    use bytes::Bytes;
    use lancache_core::MirrorService;
    use lancache_proxy::{UpstreamClient, UpstreamClientConfig};
    use lancache_store::{ManifestKey, Store, compute_sha256};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const MANIFEST_JSON: &str = r#"{"schemaVersion":2,"mediaType":"application/vnd.docker.distribution.manifest.v2+json","config":{"digest":"sha256:aa","size":559},"layers":[{"digest":"sha256:bb","size":4590894944}]}"#;

    struct MockUpstream {
        url: String,
        manifest_fetches: Arc<AtomicUsize>,
        blob_fetches: Arc<AtomicUsize>,
    }

    /// A throwaway upstream registry on an ephemeral port
    async fn spawn_mock_upstream(blob: Vec<u8>) -> MockUpstream {
        let manifest_fetches = Arc::new(AtomicUsize::new(0));
        let blob_fetches = Arc::new(AtomicUsize::new(0));
        let manifest_counter = manifest_fetches.clone();
        let blob_counter = blob_fetches.clone();

        let app = Router::new()
            .route(
                "/v2/{namespace}/{repo}/manifests/{reference}",
                get(move || {
                    let counter = manifest_counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        (
                            [(
                                header::CONTENT_TYPE,
                                "application/vnd.docker.distribution.manifest.v2+json",
                            )],
                            MANIFEST_JSON,
                        )
                    }
                }),
            )
            .route(
                "/v2/{namespace}/{repo}/blobs/{digest}",
                get(move || {
                    let counter = blob_counter.clone();
                    let blob = blob.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        blob
                    }
                }),
            )
            .route(
                "/api/teapot",
                get(|| async { (StatusCode::IM_A_TEAPOT, "short and stout") }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        MockUpstream {
            url,
            manifest_fetches,
            blob_fetches,
        }
    }

    async fn test_state(upstream_url: &str) -> (TempDir, AppState) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(Store::open(dir.path()).await.unwrap());
        let upstream = Arc::new(
            UpstreamClient::new(UpstreamClientConfig {
                url: upstream_url.to_string(),
                ..Default::default()
            })
            .unwrap(),
        );
        let service = Arc::new(MirrorService::new(
            store,
            upstream,
            "registry.ollama.ai".to_string(),
        ));
        (dir, AppState::new(service))
    }

    fn request(method: Method, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn send(
        router: &Router,
        req: Request,
    ) -> (StatusCode, HeaderMap, Bytes) {
        let response = router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, headers, body)
    }

    async fn wait_for_blob(state: &AppState, digest: &str) {
        for _ in 0..200 {
            if state.service.store().has_blob(digest).await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("blob {} never committed", digest);
    }

    #[tokio::test]
    async fn test_version_probe() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let router = create_router(state, None);

        let (status, headers, body) = send(&router, request(Method::GET, "/v2/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers.get("docker-distribution-api-version").unwrap(),
            "registry/2.0"
        );
        assert_eq!(body.as_ref(), b"{}");
    }

    #[tokio::test]
    async fn test_manifest_miss_then_hit() {
        let upstream = spawn_mock_upstream(Vec::new()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state.clone(), None);

        let (status, _, first) =
            send(&router, request(Method::GET, "/v2/library/llama3/manifests/8b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(first.as_ref(), MANIFEST_JSON.as_bytes());
        assert_eq!(upstream.manifest_fetches.load(Ordering::SeqCst), 1);

        // Second pull is fully local with identical bytes
        let (status, headers, second) =
            send(&router, request(Method::GET, "/v2/library/llama3/manifests/8b")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(second, first);
        assert_eq!(upstream.manifest_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(
            headers.get("content-type").unwrap(),
            "application/vnd.docker.distribution.manifest.v2+json"
        );
        assert_eq!(
            headers.get("docker-content-digest").unwrap(),
            compute_sha256(MANIFEST_JSON.as_bytes()).as_str()
        );

        let key = ManifestKey::new("registry.ollama.ai", "library", "llama3", "8b");
        assert!(state.service.store().has_manifest(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_manifest_head_hit_has_no_body() {
        let upstream = spawn_mock_upstream(Vec::new()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state, None);

        send(&router, request(Method::GET, "/v2/library/llama3/manifests/8b")).await;

        let (status, headers, body) =
            send(&router, request(Method::HEAD, "/v2/library/llama3/manifests/8b")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            headers.get("content-length").unwrap().to_str().unwrap(),
            MANIFEST_JSON.len().to_string()
        );
        assert!(headers.contains_key("docker-content-digest"));
    }

    #[tokio::test]
    async fn test_manifest_head_miss_passes_through_without_caching() {
        let upstream = spawn_mock_upstream(Vec::new()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state.clone(), None);

        let (status, _, body) =
            send(&router, request(Method::HEAD, "/v2/library/llama3/manifests/8b")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());

        let key = ManifestKey::new("registry.ollama.ai", "library", "llama3", "8b");
        assert!(!state.service.store().has_manifest(&key).await.unwrap());
    }

    fn ten_mib() -> Vec<u8> {
        b"0123456789".repeat(1_048_576)
    }

    async fn state_with_cached_blob(data: &[u8]) -> (TempDir, AppState, String) {
        let (dir, state) = test_state("http://127.0.0.1:9").await;
        let digest = compute_sha256(data);
        state
            .service
            .store()
            .store_blob_bytes(&digest, Bytes::copy_from_slice(data))
            .await
            .unwrap();
        (dir, state, digest)
    }

    #[tokio::test]
    async fn test_cached_blob_full_get() {
        let data = b"layer-bytes-for-full-get".to_vec();
        let (_dir, state, digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let uri = format!("/v2/library/x/blobs/{}", digest);
        let (status, headers, body) = send(&router, request(Method::GET, &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), data.as_slice());
        assert_eq!(headers.get("content-type").unwrap(), "application/octet-stream");
        assert_eq!(headers.get("accept-ranges").unwrap(), "bytes");
        assert_eq!(headers.get("docker-content-digest").unwrap(), digest.as_str());
        assert_eq!(
            headers.get("content-length").unwrap().to_str().unwrap(),
            data.len().to_string()
        );

        // HEAD carries the same headers and no body
        let (status, headers, body) = send(&router, request(Method::HEAD, &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert_eq!(
            headers.get("content-length").unwrap().to_str().unwrap(),
            data.len().to_string()
        );
    }

    #[tokio::test]
    async fn test_range_request_on_cached_blob() {
        let data = ten_mib();
        let (_dir, state, digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/v2/library/x/blobs/{}", digest))
            .header(header::RANGE, "bytes=1048576-2097151")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&router, req).await;

        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            headers.get("content-range").unwrap(),
            "bytes 1048576-2097151/10485760"
        );
        assert_eq!(
            headers.get("content-length").unwrap().to_str().unwrap(),
            "1048576"
        );
        assert_eq!(body.as_ref(), &data[1048576..2097152]);
    }

    #[tokio::test]
    async fn test_invalid_range_on_cached_blob() {
        let data = ten_mib();
        let (_dir, state, digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/v2/library/x/blobs/{}", digest))
            .header(header::RANGE, "bytes=20000000-20000001")
            .body(Body::empty())
            .unwrap();
        let (status, headers, body) = send(&router, req).await;

        assert_eq!(status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(headers.get("content-range").unwrap(), "bytes */10485760");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_if_none_match_returns_304() {
        let data = b"conditional blob".to_vec();
        let (_dir, state, digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/v2/library/x/blobs/{}", digest))
            .header(header::IF_NONE_MATCH, format!("\"{}\"", digest))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, req).await;

        assert_eq!(status, StatusCode::NOT_MODIFIED);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_if_range_mismatch_serves_full_blob() {
        let data = b"if-range blob data".to_vec();
        let (_dir, state, digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/v2/library/x/blobs/{}", digest))
            .header(header::RANGE, "bytes=0-3")
            .header(header::IF_RANGE, "\"sha256:somethingelse\"")
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, req).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), data.as_slice());

        // With the matching validator the range applies again
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("/v2/library/x/blobs/{}", digest))
            .header(header::RANGE, "bytes=0-3")
            .header(header::IF_RANGE, format!("\"{}\"", digest))
            .body(Body::empty())
            .unwrap();
        let (status, _, body) = send(&router, req).await;
        assert_eq!(status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(body.as_ref(), &data[0..4]);
    }

    #[tokio::test]
    async fn test_blob_miss_tees_into_store() {
        let blob: Vec<u8> = (0..100_000u32).map(|i| (i % 241) as u8).collect();
        let digest = compute_sha256(&blob);
        let upstream = spawn_mock_upstream(blob.clone()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state.clone(), None);

        let uri = format!("/v2/library/x/blobs/{}", digest);
        let (status, headers, body) = send(&router, request(Method::GET, &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), blob.as_slice());
        assert_eq!(headers.get("docker-content-digest").unwrap(), digest.as_str());
        assert_eq!(upstream.blob_fetches.load(Ordering::SeqCst), 1);

        // The store write races the response; wait for the commit
        wait_for_blob(&state, &digest).await;

        // Second pull is served locally
        let (status, _, body) = send(&router, request(Method::GET, &uri)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), blob.as_slice());
        assert_eq!(upstream.blob_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_misses_all_succeed() {
        let blob: Vec<u8> = (0..64_000u32).map(|i| (i % 199) as u8).collect();
        let digest = compute_sha256(&blob);
        let upstream = spawn_mock_upstream(blob.clone()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state.clone(), None);

        let uri = format!("/v2/library/x/blobs/{}", digest);
        let mut handles = Vec::new();
        for _ in 0..10 {
            let router = router.clone();
            let uri = uri.clone();
            handles.push(tokio::spawn(async move {
                send(&router, request(Method::GET, &uri)).await
            }));
        }

        for handle in handles {
            let (status, _, body) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.as_ref(), blob.as_slice());
        }

        wait_for_blob(&state, &digest).await;
        let stats = state.service.store().stats().await.unwrap();
        // One committed file, no staging leftovers, regardless of how
        // many fetches raced
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.total_blob_bytes, blob.len() as u64);
        let fetches = upstream.blob_fetches.load(Ordering::SeqCst);
        assert!((1..=10).contains(&fetches));
    }

    #[tokio::test]
    async fn test_malformed_digest_is_passed_through() {
        let upstream = spawn_mock_upstream(b"opaque".to_vec()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state.clone(), None);

        // Wrong algorithm and wrong length both fall outside the blob
        // pattern and go to upstream untouched
        for uri in [
            "/v2/library/x/blobs/sha512:00",
            "/v2/library/x/blobs/sha256:short",
        ] {
            let (status, _, body) = send(&router, request(Method::GET, uri)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body.as_ref(), b"opaque");
        }
        assert_eq!(upstream.blob_fetches.load(Ordering::SeqCst), 2);

        // Nothing was cached
        let stats = state.service.store().stats().await.unwrap();
        assert_eq!(stats.blob_count, 0);
    }

    #[tokio::test]
    async fn test_unrelated_path_passes_through() {
        let upstream = spawn_mock_upstream(Vec::new()).await;
        let (_dir, state) = test_state(&upstream.url).await;
        let router = create_router(state, None);

        let (status, _, body) = send(&router, request(Method::GET, "/api/teapot")).await;
        assert_eq!(status, StatusCode::IM_A_TEAPOT);
        assert_eq!(body.as_ref(), b"short and stout");
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        // Nothing listens on this port
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let router = create_router(state, None);

        let (status, _, _) =
            send(&router, request(Method::GET, "/v2/library/llama3/manifests/8b")).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_stats_and_clear_endpoints() {
        let data = b"stats blob".to_vec();
        let (_dir, state, _digest) = state_with_cached_blob(&data).await;
        let router = create_router(state, None);

        let (status, _, body) = send(&router, request(Method::GET, "/cache/stats")).await;
        assert_eq!(status, StatusCode::OK);
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["blob_count"], 1);
        assert_eq!(stats["total_blob_bytes"], data.len() as u64);

        let (status, _, body) = send(&router, request(Method::POST, "/cache/clear")).await;
        assert_eq!(status, StatusCode::OK);
        let cleared: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(cleared["cleared_blobs"], 1);

        let (_, _, body) = send(&router, request(Method::GET, "/cache/stats")).await;
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["blob_count"], 0);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let (_dir, state) = test_state("http://127.0.0.1:9").await;
        let router = create_router(state, None);

        let (status, _, body) = send(&router, request(Method::GET, "/health")).await;
        assert_eq!(status, StatusCode::OK);
        let health: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(health["status"], "healthy");
        assert!(
            chrono::DateTime::parse_from_rfc3339(health["time"].as_str().unwrap()).is_ok()
        );
    }
}
