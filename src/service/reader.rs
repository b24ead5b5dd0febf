//! Streaming readers over present and still-downloading blobs.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::cache::BlobStore;
use crate::service::blobs::BlobState;

const CHUNK_SIZE: usize = 4096;

/// A reader over a single blob, decoupled from the download feeding it.
///
/// The reader keeps its own position and blocks at the end of the
/// currently available data until the download advances or terminates.
/// It holds its file descriptor open from the start, so a concurrent
/// promotion, eviction or failed-download cleanup never truncates what it
/// observes.
#[derive(Debug)]
pub struct BlobReader {
    state: Arc<BlobState>,
    progress: tokio::sync::watch::Receiver<crate::service::blobs::FetchProgress>,
    file: File,
    pos: u64,
}

impl BlobReader {
    pub(crate) async fn open(state: Arc<BlobState>, store: &BlobStore) -> io::Result<Self> {
        let digest = state.digest();
        let fetching = state.snapshot().fetching;
        let path = if fetching {
            store.part_path(digest)
        } else {
            store.blob_path(digest)
        };

        let file = match File::open(&path).await {
            Ok(file) => file,
            // the download was promoted between the snapshot and the
            // open; its bytes now live under the final name
            Err(error) if fetching && error.kind() == io::ErrorKind::NotFound => {
                File::open(store.blob_path(digest)).await?
            }
            Err(error) => return Err(error),
        };
        let progress = state.subscribe();

        Ok(Self {
            state,
            progress,
            file,
            pos: 0,
        })
    }

    /// Reads the next chunk, waiting for the download where necessary.
    ///
    /// Returns `None` once the logical end of the blob is reached. Bytes
    /// already written to the partial file are always served, even after
    /// the download failed; the failure only surfaces once the reader
    /// catches up with the last written byte.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.pos == self.state.length() {
                return Ok(None);
            }

            let pos = self.pos;
            let progress = self
                .progress
                .wait_for(|progress| {
                    pos < progress.fetch_pos || progress.failed || !progress.fetching
                })
                .await
                .map(|progress| *progress)
                .map_err(|_| io::Error::other("blob fetch failed"))?;

            if pos >= progress.fetch_pos {
                // woken without new data: the fetch terminated short
                return Err(io::Error::other("blob fetch failed"));
            }

            let mut buf = vec![0; CHUNK_SIZE];
            let n = self.file.read(&mut buf).await?;

            if n == 0 {
                if !progress.fetching {
                    return Err(io::ErrorKind::UnexpectedEof.into());
                }
                // the file has not caught up with the advertised
                // progress yet; there will be more
                let _ = self.progress.changed().await;
                continue;
            }

            buf.truncate(n);
            self.pos += n as u64;
            return Ok(Some(buf.into()));
        }
    }

    /// Turns the reader into a byte stream suitable for a response body.
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> {
        futures::stream::try_unfold(self, |mut reader| async move {
            let chunk = reader.next_chunk().await?;
            Ok(chunk.map(|chunk| (chunk, reader)))
        })
    }
}
