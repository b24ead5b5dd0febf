use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer};
use tracing::level_filters::LevelFilter;

/// Controls the log format.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the mirror.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "blobmirror".into(),
        }
    }
}

/// Static configuration of the mirror, loaded from a YAML file.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Which directory to use for the blob cache.
    pub cache_dir: PathBuf,

    /// Base URLs of sibling mirrors to ask for missing blobs before
    /// falling back to the upstream registry.
    pub peers: Vec<String>,

    /// Keep the cache under this size (in MiB). A value of `0` disables
    /// the cache cleaner entirely.
    pub cache_size_mib: u64,

    /// Interval between cache cleaner sweeps.
    #[serde(with = "humantime_serde")]
    pub cache_check_interval: Duration,

    /// The timeout for establishing an outbound connection, applied to
    /// peer probes, upstream fetches and proxied requests alike.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,
}

impl Config {
    /// Returns the directory blobs are cached under.
    pub fn blobs_dir(&self) -> PathBuf {
        self.cache_dir.join("blobs")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: "0.0.0.0:80".to_owned(),
            cache_dir: PathBuf::from("cache"),
            peers: Vec::new(),
            cache_size_mib: 0,
            cache_check_interval: Duration::from_secs(3600),
            connect_timeout: Duration::from_secs(1),
            logging: Logging::default(),
            metrics: Metrics::default(),
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl<'de> de::Visitor<'de> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert_eq!(cfg.bind, "0.0.0.0:80");
        assert_eq!(cfg.cache_dir, PathBuf::from("cache"));
        assert!(cfg.peers.is_empty());
        assert_eq!(cfg.cache_size_mib, 0);
        assert_eq!(cfg.cache_check_interval, Duration::from_secs(3600));
    }

    #[test]
    fn test_mirror_config() {
        let yaml = r#"
            bind: 127.0.0.1:8080
            cache_dir: /var/lib/blobmirror
            peers:
              - http://mirror-1.internal
              - http://mirror-2.internal
            cache_size_mib: 2048
            cache_check_interval: 15m
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:8080");
        assert_eq!(cfg.blobs_dir(), PathBuf::from("/var/lib/blobmirror/blobs"));
        assert_eq!(cfg.peers.len(), 2);
        assert_eq!(cfg.cache_size_mib, 2048);
        assert_eq!(cfg.cache_check_interval, Duration::from_secs(15 * 60));
        // untouched fields keep their defaults
        assert_eq!(cfg.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_unknown_fields() {
        // Unknown fields should not cause failure
        let yaml = r#"
            not_a_field: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // Empty files aren't supported
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }

    #[test]
    fn test_log_level() {
        let yaml = r#"
            logging:
              level: debug
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);

        let yaml = r#"
            logging:
              level: shouting
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }
}
