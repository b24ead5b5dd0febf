//! The shared state behind the HTTP request handlers.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::service::blobs::BlobService;

pub mod blobs;
pub mod digest;
pub mod reader;

/// The underlying service for the HTTP request handlers.
#[derive(Clone, Debug)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

#[derive(Debug)]
struct ServiceInner {
    config: Config,
    client: reqwest::Client,
    blobs: BlobService,
}

impl Service {
    /// Creates the [`Service`], opening the blob store on disk.
    pub fn create(config: Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("failed to create the HTTP client")?;

        let blobs =
            BlobService::new(&config, client.clone()).context("failed to open the blob store")?;

        Ok(Self {
            inner: Arc::new(ServiceInner {
                config,
                client,
                blobs,
            }),
        })
    }

    /// Gives access to the [`Config`].
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The shared outbound HTTP client.
    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    /// The blob cache.
    pub fn blobs(&self) -> &BlobService {
        &self.inner.blobs
    }
}
