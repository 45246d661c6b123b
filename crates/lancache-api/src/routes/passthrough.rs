//! Transparent pass-through to the upstream registry

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::response::Builder;
use axum::response::Response;
use futures::TryStreamExt;
use tracing::debug;

use crate::error::ApiError;
use crate::state::AppState;

/// Headers never copied from an upstream response; the local server
/// owns connection handling and body framing.
const STRIP_RESPONSE: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Forward an unrecognized request to upstream and mirror the answer.
///
/// Method, path, query, headers, and body all pass through; the
/// response streams back without buffering.
pub async fn passthrough(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    debug!("Pass-through: {} {}", parts.method, path_and_query);

    let body = reqwest::Body::wrap_stream(body.into_data_stream());
    let upstream = state
        .service
        .upstream()
        .forward(parts.method, &path_and_query, &parts.headers, body)
        .await?;

    Ok(mirror_response(upstream))
}

/// Copy mirrorable headers from an upstream response onto a builder
pub fn copy_response_headers(mut builder: Builder, headers: &HeaderMap) -> Builder {
    for (name, value) in headers {
        if STRIP_RESPONSE.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder
}

/// Convert an upstream response into a client response, streaming the
/// body through untouched.
pub fn mirror_response(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let builder = copy_response_headers(Response::builder().status(status), upstream.headers());

    let stream = upstream.bytes_stream().map_err(std::io::Error::other);
    builder
        .body(Body::from_stream(stream))
        .expect("mirrored response parts are valid")
}
