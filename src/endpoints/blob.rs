//! Serving blobs out of the streaming cache.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::service::blobs::UpstreamRequest;
use crate::service::digest;
use crate::service::Service;

use super::ResponseError;

/// The response header carrying the blob's digest.
const DIGEST_HEADER: &str = "docker-content-digest";

/// `GET /blobs/{digest}`, the endpoint sibling mirrors probe.
///
/// Answers only from the local cache (or a download already in flight);
/// a miss is a plain 404 and never triggers an upstream fetch.
pub async fn serve_cached_blob(
    State(service): State<Service>,
    Path(digest): Path<String>,
) -> Response {
    if !digest::is_valid(&digest) {
        return ResponseError::new(StatusCode::NOT_FOUND).into_response();
    }

    serve_blob(&service, &digest, None).await
}

/// Streams a blob to the client, fetching it first if necessary.
///
/// All concurrent requests for the same missing blob share one download
/// and stream from the partial file while it is still being written.
pub async fn serve_blob(
    service: &Service,
    digest: &str,
    upstream: Option<UpstreamRequest>,
) -> Response {
    metric!(counter("blobs.requests") += 1);

    let state = match service.blobs().acquire(digest, upstream).await {
        Ok(state) => state,
        Err(error) => return ResponseError::from(error).into_response(),
    };

    let reader = match state.reader(service.blobs().store()).await {
        Ok(reader) => reader,
        Err(error) => {
            tracing::error!("failed to read blob {digest}: {error}");
            return ResponseError::new(StatusCode::BAD_GATEWAY).into_response();
        }
    };

    let mut response = Response::new(Body::from_stream(reader.into_stream()));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(state.length()));
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    if let Ok(value) = HeaderValue::from_str(state.digest()) {
        headers.insert(DIGEST_HEADER, value);
    }

    response
}
