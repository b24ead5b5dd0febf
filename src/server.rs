use std::net::SocketAddr;

use anyhow::{Context, Result};

use crate::cache::Cleaner;
use crate::config::Config;
use crate::endpoints;
use crate::service::Service;

/// Starts the mirror and the background cache cleaner.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to
    // see restarts even if service creation fails.
    metric!(counter("server.starting") += 1);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("blobmirror")
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let service = Service::create(config).context("failed to create service state")?;

        match Cleaner::from_config(service.config()) {
            Some(cleaner) => {
                tracing::info!("starting cache cleaner");
                let check_interval = service.config().cache_check_interval;
                tokio::spawn(cleaner.run(check_interval));
            }
            None => tracing::info!("no cache size budget configured, cache cleanup will not run"),
        }

        let addr: SocketAddr = service
            .config()
            .bind
            .parse()
            .context("invalid bind address")?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind to {addr}"))?;
        tracing::info!("listening on {}", listener.local_addr()?);

        let app = endpoints::create_app(service);
        axum::serve(listener, app).await.context("server failed")
    })
}
