use axum::routing::get;
use axum::Router;

use crate::service::Service;

mod blob;
mod error;
mod mirror;
mod proxy;

pub use error::ResponseError;

pub async fn healthcheck() -> &'static str {
    crate::metric!(counter("healthcheck") += 1);
    "ok"
}

/// Builds the mirror application.
///
/// Only the peer blob endpoint and the healthcheck are routed explicitly;
/// everything else is a mirrored registry path handled by the fallback.
pub fn create_app(service: Service) -> Router {
    Router::new()
        .route("/healthcheck", get(healthcheck))
        .route("/blobs/{digest}", get(blob::serve_cached_blob))
        .fallback(mirror::mirror_request)
        .with_state(service)
}
