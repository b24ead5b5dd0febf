//! Transparent reverse proxying of non-blob registry requests.

use axum::body::Body;
use axum::extract::Request;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};

use crate::service::Service;

use super::ResponseError;

/// Hop-by-hop headers, which describe a single connection and must not
/// travel through the proxy in either direction.
fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Forwards the request to the rewritten upstream URL and streams the
/// answer back unchanged.
pub async fn forward(service: &Service, request: Request, url: reqwest::Url) -> Response {
    metric!(counter("proxy.requests") += 1);

    let (parts, body) = request.into_parts();

    let mut builder = service.client().request(parts.method, url);
    for (name, value) in &parts.headers {
        // host and content-length of the outbound request are derived
        // from the rewritten URL and the forwarded body instead
        if is_hop_by_hop(name) || matches!(name.as_str(), "host" | "content-length") {
            continue;
        }
        builder = builder.header(name, value);
    }
    builder = builder.body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match builder.send().await {
        Ok(upstream) => upstream,
        Err(error) => {
            tracing::error!("proxy request failed: {error}");
            return ResponseError::new(StatusCode::BAD_GATEWAY).into_response();
        }
    };

    let mut response = Response::new(Body::empty());
    *response.status_mut() = upstream.status();
    let headers = response.headers_mut();
    for (name, value) in upstream.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    *response.body_mut() = Body::from_stream(upstream.bytes_stream());

    response
}
