//! Routing of mirrored registry paths.
//!
//! An inbound path `/<scheme>/<host>/<rest>` addresses the upstream URL
//! `<scheme>://<host>/<rest>`. Blob downloads go through the cache; every
//! other request is reverse-proxied unchanged.

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::service::blobs::UpstreamRequest;
use crate::service::Service;

use super::{blob, proxy, ResponseError};

static BLOB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|/)blobs/([[:alnum:]]+:[0-9a-f]+)$").unwrap());

pub async fn mirror_request(State(service): State<Service>, request: Request) -> Response {
    let path = request.uri().path();
    let trimmed = path.strip_prefix('/').unwrap_or(path);

    let Some((scheme, remainder)) = trimmed.split_once('/') else {
        return "registries mirror\n".into_response();
    };

    let Some((host, rest)) = remainder.split_once('/') else {
        // a registry root without a trailing slash; canonicalize
        return Redirect::permanent(&format!("{path}/")).into_response();
    };

    if host.is_empty() {
        return ResponseError::new(StatusCode::NOT_FOUND).into_response();
    }

    let rest = format!("/{rest}");
    let Some(upstream_url) = upstream_url(scheme, host, &rest, request.uri()) else {
        tracing::warn!("unroutable mirror path: {path}");
        return ResponseError::new(StatusCode::BAD_GATEWAY).into_response();
    };

    if request.method() == Method::GET {
        if let Some(captures) = BLOB_RE.captures(&rest) {
            let digest = captures[1].to_owned();
            tracing::info!("serving blob {digest}");

            let upstream = UpstreamRequest {
                url: upstream_url,
                accept: request.headers().get(header::ACCEPT).cloned(),
                authorization: request.headers().get(header::AUTHORIZATION).cloned(),
            };
            return blob::serve_blob(&service, &digest, Some(upstream)).await;
        }
    }

    tracing::debug!("proxying {upstream_url}");
    proxy::forward(&service, request, upstream_url).await
}

fn upstream_url(scheme: &str, host: &str, rest: &str, uri: &Uri) -> Option<reqwest::Url> {
    let mut url = format!("{scheme}://{host}{rest}");
    if let Some(query) = uri.query() {
        url.push('?');
        url.push_str(query);
    }
    url.parse().ok()
}
