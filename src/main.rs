//! Blobmirror.
//!
//! Blobmirror is a caching pull-through mirror for content-addressed blob
//! storage. It sits in front of one or more upstream registries serving
//! immutable, digest-named artifacts (Docker/OCI-style distribution).
//! Blob requests are answered from a local content-addressed cache, or
//! fetched from a sibling mirror or the upstream registry while streaming
//! to all waiting clients at once. Everything else is reverse-proxied
//! unchanged.

#[macro_use]
mod metrics;

mod cache;
mod cli;
mod config;
mod endpoints;
mod logging;
mod server;
mod service;

#[cfg(test)]
mod test;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::log_fatal_error(&error);
            std::process::exit(1);
        }
    }
}
