use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::service::blobs::BlobError;

/// An error rendered as a plain status-text response.
///
/// Registry clients expect terse text bodies on failed blob requests, not
/// structured payloads.
#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
}

impl ResponseError {
    pub fn new(status: StatusCode) -> Self {
        Self { status }
    }
}

impl From<BlobError> for ResponseError {
    fn from(error: BlobError) -> Self {
        Self::new(error.status())
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        let reason = self.status.canonical_reason().unwrap_or("");
        (self.status, format!("{reason}\n")).into_response()
    }
}
