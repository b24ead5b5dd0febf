//! The on-disk blob store and the cache cleaner.
//!
//! Blobs live under `<cache_dir>/blobs/`, one file per blob named exactly
//! by its digest string. A download in progress is written to the sibling
//! name `<digest>.part` and atomically renamed once verified, so the final
//! name never refers to an incomplete file.
//!
//! The cleaner enforces a size budget over the whole cache directory by
//! evicting the least recently accessed files first. Access times are
//! refreshed on cache hits (debounced to once a minute) so that hot blobs
//! survive sweeps even on file systems mounted with `noatime`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};
use filetime::FileTime;
use tokio::time::MissedTickBehavior;

use crate::config::Config;

/// The interval in which access times of cache hits are refreshed.
///
/// Refreshing on every single hit would thrash inode attributes under a
/// high cache-hit rate; once a minute is plenty for eviction ordering.
const TOUCH_EVERY: Duration = Duration::from_secs(60);

/// The maps from digests to their cache file locations.
#[derive(Debug)]
pub struct BlobStore {
    blobs_dir: PathBuf,
}

impl BlobStore {
    /// Opens the blob store, creating the directory if necessary and
    /// clearing out partial files a previous process left behind.
    pub fn new(config: &Config) -> io::Result<Self> {
        let blobs_dir = config.blobs_dir();
        fs::create_dir_all(&blobs_dir)?;

        let store = Self { blobs_dir };
        store.clear_parts()?;
        Ok(store)
    }

    /// The final, content-addressed location of a blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(digest)
    }

    /// The location a blob is downloaded to before promotion.
    pub fn part_path(&self, digest: &str) -> PathBuf {
        self.blobs_dir.join(format!("{digest}.part"))
    }

    /// Refreshes the access time of a cache hit, preserving its mtime.
    ///
    /// Only files whose atime is older than [`TOUCH_EVERY`] are touched.
    pub fn touch(&self, path: &Path, metadata: &fs::Metadata) -> io::Result<()> {
        let atime = metadata.accessed()?;
        let elapsed = atime.elapsed().unwrap_or_default();
        if elapsed > TOUCH_EVERY {
            filetime::set_file_atime(path, FileTime::now())?;
        }
        Ok(())
    }

    /// Removes stale `.part` files which survive a hard crash.
    fn clear_parts(&self) -> io::Result<()> {
        for entry in fs::read_dir(&self.blobs_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "part") && path.is_file() {
                tracing::debug!("removing stale partial file {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(())
    }
}

/// A cache file eligible for eviction.
struct FileInfo {
    path: PathBuf,
    size: u64,
    atime: SystemTime,
}

/// Enforces the configured size budget over the cache directory.
#[derive(Clone, Debug)]
pub struct Cleaner {
    cache_dir: PathBuf,
    max_size: u64,
}

impl Cleaner {
    /// Creates a cleaner from the configuration.
    ///
    /// Returns `None` if no size budget is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        if config.cache_size_mib == 0 {
            return None;
        }

        Some(Self {
            cache_dir: config.cache_dir.clone(),
            max_size: config.cache_size_mib << 20,
        })
    }

    /// Runs the cleaner until the process exits.
    pub async fn run(self, check_interval: Duration) {
        let mut interval = tokio::time::interval(check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let cleaner = self.clone();
            match tokio::task::spawn_blocking(move || cleaner.sweep()).await {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::error!("cache sweep failed: {error:#}"),
                Err(error) => tracing::error!("cache sweep panicked: {error}"),
            }
        }
    }

    /// Performs a single sweep over the cache directory.
    ///
    /// If the total size exceeds the budget, files are removed in order of
    /// least recent access until the total fits again. A file that cannot
    /// be removed is skipped and does not count towards the reclaimed
    /// space.
    pub fn sweep(&self) -> Result<()> {
        let mut infos = Vec::new();
        collect_files(&self.cache_dir, &mut infos)
            .with_context(|| format!("failed to walk {}", self.cache_dir.display()))?;

        let mut total: u64 = infos.iter().map(|info| info.size).sum();
        if total <= self.max_size {
            return Ok(());
        }

        // oldest access first; equal atimes evict bigger files first
        infos.sort_by(|a, b| {
            a.atime
                .cmp(&b.atime)
                .then(b.size.cmp(&a.size))
                .then(a.path.cmp(&b.path))
        });

        for info in infos {
            tracing::info!("clearing cache entry {}", info.path.display());
            if let Err(error) = fs::remove_file(&info.path) {
                tracing::warn!("failed to remove {}: {}", info.path.display(), error);
                continue;
            }

            metric!(counter("cache.evicted") += 1);
            total = total.saturating_sub(info.size);

            if total <= self.max_size {
                break;
            }
        }

        Ok(())
    }
}

fn collect_files(directory: &Path, infos: &mut Vec<FileInfo>) -> io::Result<()> {
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            collect_files(&path, infos)?;
        } else if metadata.is_file() {
            infos.push(FileInfo {
                path,
                size: metadata.len(),
                atime: metadata.accessed()?,
            });
        }
    }

    Ok(())
}

/// Entry function for the cleanup command.
///
/// Performs a single sweep down to the configured size budget.
pub fn cleanup(config: Config) -> Result<()> {
    match Cleaner::from_config(&config) {
        Some(cleaner) => cleaner.sweep(),
        None => anyhow::bail!("no cache size budget configured (set `cache_size_mib`)"),
    }
}
