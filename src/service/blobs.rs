//! The concurrent streaming blob cache.
//!
//! Every digest has at most one [`BlobState`] registered while a download
//! is in flight. Requests for a blob that is already on disk never touch
//! the registry; requests for a blob that is currently downloading attach
//! to the existing state and stream from the partial file as it grows.
//!
//! The registry mutex is held across the entire lookup, including the
//! upstream header exchange. That is what makes registering a state atomic
//! with the decision to start a download and guarantees that concurrent
//! requests for the same missing blob coalesce onto a single upstream
//! fetch. Body transfer happens on a separate task, outside the lock.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use axum::http::{header, HeaderValue, StatusCode};
use futures::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};

use crate::cache::BlobStore;
use crate::config::Config;
use crate::logging;
use crate::service::digest::Checksum;
use crate::service::reader::BlobReader;

/// The upstream side of a mirrored blob request.
///
/// Carries the rewritten upstream URL and the only two request headers
/// that are forwarded verbatim.
#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: reqwest::Url,
    pub accept: Option<HeaderValue>,
    pub authorization: Option<HeaderValue>,
}

/// Reasons a blob lookup can fail before any body byte is produced.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    /// The blob is not in the local cache and this lookup must not fetch.
    #[error("blob is not cached locally")]
    NotCached,

    /// Neither a peer nor the upstream could be reached.
    #[error("no source could provide the blob")]
    Unreachable,

    /// The upstream answered with a non-200 status, passed through.
    #[error("upstream responded with status {0}")]
    Upstream(StatusCode),

    /// The upstream did not declare a usable `Content-Length`.
    #[error("upstream did not declare a valid content length")]
    InvalidLength,

    /// The local blob store failed.
    #[error("failed to access the local blob store")]
    Io(#[from] io::Error),
}

impl BlobError {
    /// The HTTP status describing this error to a client.
    pub fn status(&self) -> StatusCode {
        match self {
            BlobError::NotCached => StatusCode::NOT_FOUND,
            BlobError::Upstream(status) => *status,
            BlobError::Unreachable | BlobError::InvalidLength | BlobError::Io(_) => {
                StatusCode::BAD_GATEWAY
            }
        }
    }
}

/// Errors terminating a running download.
#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("failed to read from remote")]
    Download(#[source] reqwest::Error),

    #[error("failed to write to the partial file")]
    Io(#[from] io::Error),

    #[error("wrong checksum: expected {expected}, got {actual}")]
    Checksum { expected: String, actual: String },
}

/// A progress snapshot shared between the fetcher and its readers.
///
/// `fetch_pos` only ever grows, and it never runs ahead of what has been
/// durably written to the partial file.
#[derive(Clone, Copy, Debug)]
pub(crate) struct FetchProgress {
    pub fetch_pos: u64,
    pub fetching: bool,
    pub failed: bool,
}

/// The shared per-digest state of a present or downloading blob.
#[derive(Debug)]
pub struct BlobState {
    digest: String,
    length: u64,
    progress: watch::Sender<FetchProgress>,
}

impl BlobState {
    /// State for a blob that is fully present on disk.
    fn present(digest: &str, length: u64) -> Self {
        let (progress, _) = watch::channel(FetchProgress {
            fetch_pos: length,
            fetching: false,
            failed: false,
        });
        Self {
            digest: digest.to_owned(),
            length,
            progress,
        }
    }

    /// State for a blob whose download is about to start.
    fn fetching(digest: &str, length: u64) -> Self {
        let (progress, _) = watch::channel(FetchProgress {
            fetch_pos: 0,
            fetching: true,
            failed: false,
        });
        Self {
            digest: digest.to_owned(),
            length,
            progress,
        }
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// The total byte length of the blob.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub(crate) fn snapshot(&self) -> FetchProgress {
        *self.progress.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<FetchProgress> {
        self.progress.subscribe()
    }

    /// Records `n` more bytes as durably written, waking all readers.
    fn advance(&self, n: u64) {
        self.progress.send_modify(|progress| progress.fetch_pos += n);
    }

    /// Marks the download as terminated, waking all readers one last time.
    fn finish(&self, failed: bool) {
        self.progress.send_modify(|progress| {
            progress.fetching = false;
            progress.failed |= failed;
        });
    }

    /// Opens a streaming reader over this blob.
    ///
    /// The reader follows the download if one is still in progress.
    pub async fn reader(self: &Arc<Self>, store: &BlobStore) -> io::Result<BlobReader> {
        BlobReader::open(self.clone(), store).await
    }
}

/// The coordination layer in front of the blob store.
#[derive(Clone, Debug)]
pub struct BlobService {
    inner: Arc<BlobServiceInner>,
}

#[derive(Debug)]
struct BlobServiceInner {
    store: BlobStore,
    client: reqwest::Client,
    peers: Vec<String>,
    states: Mutex<HashMap<String, Arc<BlobState>>>,
}

impl BlobService {
    pub fn new(config: &Config, client: reqwest::Client) -> io::Result<Self> {
        let store = BlobStore::new(config)?;

        Ok(Self {
            inner: Arc::new(BlobServiceInner {
                store,
                client,
                peers: config.peers.clone(),
                states: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn store(&self) -> &BlobStore {
        &self.inner.store
    }

    /// Looks up or creates the [`BlobState`] for a digest.
    ///
    /// A blob already on disk is answered directly and its access time is
    /// refreshed. A blob currently downloading returns the in-flight
    /// state. Otherwise a download is started from the first willing
    /// source, unless `upstream` is `None` (the hit-only peer endpoint).
    pub async fn acquire(
        &self,
        digest: &str,
        upstream: Option<UpstreamRequest>,
    ) -> Result<Arc<BlobState>, BlobError> {
        let inner = &self.inner;
        let mut states = inner.states.lock().await;

        if let Some(state) = states.get(digest) {
            return Ok(state.clone());
        }

        let blob_path = inner.store.blob_path(digest);
        match tokio::fs::metadata(&blob_path).await {
            Ok(metadata) => {
                if let Err(error) = inner.store.touch(&blob_path, &metadata) {
                    tracing::warn!(
                        "failed to refresh access time of {}: {}",
                        blob_path.display(),
                        error
                    );
                }
                return Ok(Arc::new(BlobState::present(digest, metadata.len())));
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => {
                tracing::error!("failed to stat blob {digest}: {error}");
                return Err(BlobError::Io(error));
            }
        }

        let Some(upstream) = upstream else {
            return Err(BlobError::NotCached);
        };

        let part_path = inner.store.part_path(digest);
        let out = match File::create(&part_path).await {
            Ok(out) => out,
            Err(error) => {
                tracing::error!("failed to create {}: {}", part_path.display(), error);
                return Err(BlobError::Io(error));
            }
        };

        // From here on the partial file exists on disk and must not
        // survive any exit that does not hand it off to the fetcher.
        let response = match self.open_source(digest, &upstream).await {
            Ok(response) => response,
            Err(error) => {
                drop(out);
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(error);
            }
        };

        let Some(length) = content_length(&response) else {
            tracing::error!(
                "invalid content length returned by remote for blob {digest}: {:?}",
                response.headers().get(header::CONTENT_LENGTH)
            );
            drop(out);
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(BlobError::InvalidLength);
        };

        let state = Arc::new(BlobState::fetching(digest, length));
        states.insert(digest.to_owned(), state.clone());

        tokio::spawn(self.clone().fetch(state.clone(), response, out));

        Ok(state)
    }

    /// Opens a download for a missing blob.
    ///
    /// Peers are probed in their configured order first; the canonical
    /// upstream is only contacted when no peer has the blob.
    async fn open_source(
        &self,
        digest: &str,
        upstream: &UpstreamRequest,
    ) -> Result<reqwest::Response, BlobError> {
        if let Some(response) = self.probe_peers(digest).await {
            return Ok(response);
        }

        tracing::info!("fetching blob {} from {}", digest, upstream.url);

        let mut request = self.inner.client.get(upstream.url.clone());
        if let Some(accept) = &upstream.accept {
            request = request.header(header::ACCEPT, accept.clone());
        }
        if let Some(authorization) = &upstream.authorization {
            request = request.header(header::AUTHORIZATION, authorization.clone());
        }

        let response = request.send().await.map_err(|error| {
            tracing::error!("fetch of blob {digest} failed: {error}");
            BlobError::Unreachable
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(BlobError::Upstream(status));
        }

        Ok(response)
    }

    async fn probe_peers(&self, digest: &str) -> Option<reqwest::Response> {
        for peer in &self.inner.peers {
            let url = format!("{}/blobs/{}", peer.trim_end_matches('/'), digest);
            match self.inner.client.get(&url).send().await {
                Ok(response) if response.status() == StatusCode::OK => {
                    tracing::info!("found blob {digest} on peer {peer}");
                    return Some(response);
                }
                Ok(_) => {}
                Err(error) => tracing::warn!("peer {peer} failed: {error}"),
            }
        }

        None
    }

    /// Streams the response body into the partial file and promotes it.
    ///
    /// Runs on its own task, detached from the requesting client; a client
    /// hanging up never aborts a download other readers still follow.
    async fn fetch(self, state: Arc<BlobState>, response: reqwest::Response, mut out: File) {
        let digest = state.digest().to_owned();
        let part_path = self.inner.store.part_path(&digest);

        let result = self.transfer(&state, response, &mut out).await;
        drop(out);

        let ok = match result {
            Ok(()) => {
                let blob_path = self.inner.store.blob_path(&digest);
                match tokio::fs::rename(&part_path, &blob_path).await {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::error!("failed to promote blob {digest}: {error}");
                        false
                    }
                }
            }
            Err(error) => {
                tracing::error!("blob {digest}: {}", logging::error_chain(&error));
                false
            }
        };

        if !ok {
            let _ = tokio::fs::remove_file(&part_path).await;
        }

        // The rename (or the deletion) must be visible before the next
        // request for this digest consults the file system again.
        self.inner.states.lock().await.remove(&digest);
        state.finish(!ok);

        if ok {
            metric!(counter("blobs.fetched") += 1);
        }
    }

    async fn transfer(
        &self,
        state: &BlobState,
        response: reqwest::Response,
        out: &mut File,
    ) -> Result<(), FetchError> {
        let mut checksum = Checksum::for_digest(state.digest());
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::Download)?;

            if let Some(checksum) = checksum.as_mut() {
                checksum.update(&chunk);
            }

            out.write_all(&chunk).await?;
            state.advance(chunk.len() as u64);
        }

        out.flush().await?;

        if let Some(checksum) = checksum.take() {
            let expected = crate::service::digest::split(state.digest())
                .map(|(_, hash)| hash)
                .unwrap_or_default();
            let actual = checksum.finalize();
            if actual != expected {
                return Err(FetchError::Checksum {
                    expected: expected.to_owned(),
                    actual,
                });
            }
        }

        Ok(())
    }
}

/// Parses the declared `Content-Length` of an upstream response.
fn content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}
