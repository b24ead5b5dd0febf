//! Helpers for testing the mirror.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that
//!    all console output is captured by the test runner.
//!
//!  - When using [`tempdir`], hold on to the handle for the lifetime of
//!    the test; dropping it deletes the directory under the service.
//!
//!  - When using [`Server`] or [`mirror_server`], keep the server alive
//!    until all requests to it have been made. A dropped server leaves
//!    its connections to time out.

use std::collections::BTreeMap;
use std::net::{SocketAddr, TcpListener};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Body;
use axum::extract;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{middleware, Router};
use futures::StreamExt;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use crate::config::Config;
use crate::endpoints;
use crate::service::Service;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// The logger only captures logs from this crate and mutes all others.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("blobmirror=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A config using the given cache directory, with ports left to the OS.
pub fn test_config(cache_dir: &Path) -> Config {
    Config {
        cache_dir: cache_dir.to_owned(),
        ..Config::default()
    }
}

/// Polls a condition until it holds, panicking after a couple of seconds.
///
/// Downloads are detached from the requesting client, so on-disk effects
/// like promotion or cleanup can trail the response body slightly.
pub async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// A test server that binds to a random port and serves a web app.
///
/// The server counts all requests that happen, to be accessed via
/// [`accesses`](Self::accesses) or [`all_hits`](Self::all_hits). It
/// requires a `tokio` runtime and automatically stops serving when
/// dropped.
#[derive(Debug)]
pub struct Server {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl Server {
    /// Creates a new Server with the given [`Router`].
    pub fn with_router(router: Router) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |request: extract::Request, next: middleware::Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(request.uri().path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(request).await
                }
            }
        };

        let router = router.layer(middleware::from_fn(hitcounter));

        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            handle,
            socket,
            hits,
        }
    }

    /// The port the server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns the sum total of hits and clears the hit counts.
    pub fn accesses(&self) -> usize {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_values().sum()
    }

    /// Returns a sorted list of `(path, hits)`-tuples, and clears the hit counts.
    pub fn all_hits(&self) -> Vec<(String, usize)> {
        let map = std::mem::take(&mut *self.hits.lock().unwrap());
        map.into_iter().collect()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Spawns a mirror over the given config, serving on a random port.
pub fn mirror_server(config: Config) -> Server {
    let service = Service::create(config).unwrap();
    Server::with_router(endpoints::create_app(service))
}

/// A router behaving like an upstream registry serving fixed blobs.
///
/// It has a couple of routes with different behavior:
///
/// - `/v2/{name}/blobs/{digest}` serves the configured body at once.
/// - `/slow/{name}/blobs/{digest}` drips the body a few bytes at a time.
/// - `/nolength/{name}/blobs/{digest}` streams without a `Content-Length`.
/// - `/v2/{name}/manifests/{tag}` answers a fixed manifest stub.
///
/// Unknown digests answer `404 Not Found`.
pub fn registry_router(blobs: BTreeMap<String, Vec<u8>>) -> Router {
    let blobs = Arc::new(blobs);

    let plain = {
        let blobs = blobs.clone();
        move |extract::Path((_name, digest)): extract::Path<(String, String)>| {
            let blobs = blobs.clone();
            async move {
                match blobs.get(&digest) {
                    Some(body) => body.clone().into_response(),
                    None => StatusCode::NOT_FOUND.into_response(),
                }
            }
        }
    };

    let slow = {
        let blobs = blobs.clone();
        move |extract::Path((_name, digest)): extract::Path<(String, String)>| {
            let blobs = blobs.clone();
            async move {
                let Some(body) = blobs.get(&digest) else {
                    return StatusCode::NOT_FOUND.into_response();
                };

                let length = body.len() as u64;
                let chunks: Vec<_> = body
                    .chunks(2)
                    .map(|chunk| Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(chunk)))
                    .collect();
                let stream = futures::stream::iter(chunks).then(|chunk| async move {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                    chunk
                });

                let mut response = Response::new(Body::from_stream(stream));
                response
                    .headers_mut()
                    .insert(header::CONTENT_LENGTH, HeaderValue::from(length));
                response
            }
        }
    };

    let nolength = {
        let blobs = blobs.clone();
        move |extract::Path((_name, digest)): extract::Path<(String, String)>| {
            let blobs = blobs.clone();
            async move {
                let Some(body) = blobs.get(&digest) else {
                    return StatusCode::NOT_FOUND.into_response();
                };

                let chunk = Ok::<_, std::io::Error>(bytes::Bytes::copy_from_slice(body));
                Response::new(Body::from_stream(futures::stream::iter(vec![chunk])))
            }
        }
    };

    Router::new()
        .route("/v2/{name}/blobs/{digest}", get(plain))
        .route("/slow/{name}/blobs/{digest}", get(slow))
        .route("/nolength/{name}/blobs/{digest}", get(nolength))
        .route(
            "/v2/{name}/manifests/{tag}",
            get(|| async { "{\"schemaVersion\":2}" }),
        )
}
