//! Long-lived client for the real upstream registry

use http::{HeaderMap, Method, header};
use reqwest::{Client, Response};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

use crate::error::ProxyError;

/// Accept values sent upstream when the client did not provide any
const DEFAULT_MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

/// Upstream client configuration
#[derive(Clone, Debug)]
pub struct UpstreamClientConfig {
    /// Base URL of the real registry (e.g. "https://registry.ollama.ai")
    pub url: String,
    /// Total timeout applied to control requests (probes, manifests,
    /// pass-through). Blob streams are exempt.
    pub control_timeout: Duration,
    /// Per-read idle timeout; the only timeout blob streams see, so
    /// multi-gigabyte transfers are never cut off mid-flight.
    pub read_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            control_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Shared HTTP client for the upstream registry.
///
/// Safe for concurrent use from any worker; connections are pooled by
/// reqwest. All upstream traffic is HTTPS with certificate
/// verification.
#[derive(Debug)]
pub struct UpstreamClient {
    base: Url,
    client: Client,
    control_timeout: Duration,
}

impl UpstreamClient {
    /// Create a new upstream client
    pub fn new(config: UpstreamClientConfig) -> Result<Self, ProxyError> {
        let base =
            Url::parse(&config.url).map_err(|e| ProxyError::InvalidUrl(e.to_string()))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .read_timeout(config.read_timeout)
            .build()?;

        info!("Created upstream client for {}", base);

        Ok(Self {
            base,
            client,
            control_timeout: config.control_timeout,
        })
    }

    /// The upstream base URL
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn join(&self, path_and_query: &str) -> Result<Url, ProxyError> {
        self.base
            .join(path_and_query)
            .map_err(|e| ProxyError::InvalidUrl(e.to_string()))
    }

    /// Fetch a manifest, copying the client's end-to-end headers.
    ///
    /// The raw response is returned so the caller can mirror status,
    /// headers, and body to the client regardless of outcome.
    pub async fn fetch_manifest(
        &self,
        namespace: &str,
        repo: &str,
        reference: &str,
        client_headers: &HeaderMap,
    ) -> Result<Response, ProxyError> {
        let url = self.join(&format!(
            "/v2/{}/{}/manifests/{}",
            namespace, repo, reference
        ))?;
        debug!("Fetching manifest from upstream: {}", url);

        let mut headers = filter_headers(client_headers);
        if !headers.contains_key(header::ACCEPT) {
            headers.insert(
                header::ACCEPT,
                http::HeaderValue::from_static(DEFAULT_MANIFEST_ACCEPT),
            );
        }

        let response = self
            .client
            .get(url)
            .headers(headers)
            .timeout(self.control_timeout)
            .send()
            .await?;
        Ok(response)
    }

    /// Fetch a blob for tee-ing into the cache.
    ///
    /// No Range is forwarded and no whole-request timeout applies; the
    /// full body is streamed under the per-read idle timeout only.
    pub async fn fetch_blob(
        &self,
        namespace: &str,
        repo: &str,
        digest: &str,
    ) -> Result<Response, ProxyError> {
        let url = self.join(&format!("/v2/{}/{}/blobs/{}", namespace, repo, digest))?;
        debug!("Fetching blob from upstream: {}", url);

        let response = self.client.get(url).send().await?;
        Ok(response)
    }

    /// Forward an arbitrary request to upstream unchanged.
    ///
    /// Used for every path and method the mirror does not recognize.
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        client_headers: &HeaderMap,
        body: reqwest::Body,
    ) -> Result<Response, ProxyError> {
        let url = self.join(path_and_query)?;
        debug!("Passing through {} {}", method, url);

        let response = self
            .client
            .request(method, url)
            .headers(filter_headers(client_headers))
            .timeout(self.control_timeout)
            .body(body)
            .send()
            .await?;
        Ok(response)
    }
}

/// Strip hop-by-hop and connection-specific headers before forwarding.
///
/// `Host` and `Content-Length` are regenerated by reqwest for the
/// upstream connection; `Accept-Encoding` is dropped so cached bodies
/// stay identity-encoded and parseable.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    const STRIP: &[&str] = &[
        "connection",
        "keep-alive",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "transfer-encoding",
        "upgrade",
        "host",
        "content-length",
        "accept-encoding",
    ];

    let mut out = HeaderMap::new();
    for (name, value) in headers {
        if STRIP.contains(&name.as_str()) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
