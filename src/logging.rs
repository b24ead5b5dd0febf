//! Logging setup for the mirror.

use std::env;

use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogFormat};

/// The default filter directives for a configured verbosity.
///
/// Dependencies stay at `info` even when the mirror itself logs at a
/// chattier level.
fn default_directives(level: LevelFilter) -> String {
    if level > LevelFilter::INFO {
        format!("info,blobmirror={level}")
    } else {
        level.to_string()
    }
}

/// Initializes the global tracing subscriber.
///
/// An explicit `RUST_LOG` takes precedence over the configured level.
/// `RUST_BACKTRACE` is toggled based on [`enable_backtraces`].
///
/// [`enable_backtraces`]: crate::config::Logging::enable_backtraces
pub fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        env::set_var("RUST_BACKTRACE", "1");
    }

    let directives =
        env::var("RUST_LOG").unwrap_or_else(|_| default_directives(config.logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(EnvFilter::new(directives));

    let format = match config.logging.format {
        LogFormat::Auto if console::user_attended() => LogFormat::Pretty,
        other => other,
    };

    match format {
        LogFormat::Auto | LogFormat::Simplified => builder.compact().init(),
        LogFormat::Pretty => builder.pretty().init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Formats an error with its chain of causes on a single line.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Reports a fatal error, falling back to stderr when the logger never
/// came up.
pub fn log_fatal_error(error: &anyhow::Error) {
    if tracing::event_enabled!(tracing::Level::ERROR) {
        tracing::error!("{error:#}");
    } else {
        eprintln!("error: {error:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives() {
        assert_eq!(default_directives(LevelFilter::OFF), "off");
        assert_eq!(
            default_directives(LevelFilter::INFO).to_lowercase(),
            "info"
        );
        assert_eq!(
            default_directives(LevelFilter::TRACE).to_lowercase(),
            "info,blobmirror=trace"
        );
    }

    #[test]
    fn test_error_chain() {
        let root = std::io::Error::other("disk on fire");
        let wrapped = crate::service::blobs::BlobError::Io(root);
        assert_eq!(
            error_chain(&wrapped),
            "failed to access the local blob store: disk on fire"
        );
    }
}
