use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Controls the log format
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
    /// The log level for the requester.
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
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "requester".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Invalid limits passed to [`EngineConfig::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The recency cache needs room for at least one result.
    #[error("cache capacity must be positive")]
    ZeroCacheCapacity,
    /// At least one request has to be allowed to run, and at most `u32::MAX`.
    #[error("concurrency limit must be between 1 and {max}, got {0}", max = u32::MAX)]
    InvalidConcurrencyLimit(usize),
}

/// Sizing of an [`Engine`](crate::engine::Engine).
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// How many completed, cacheable results are kept for reuse.
    pub cache_capacity: NonZeroUsize,
    /// How many requests may be running at the same time.
    pub concurrency_limit: NonZeroU32,
    /// How many submitted requests may wait for the dispatcher before submitting blocks.
    pub queue_size: NonZeroUsize,
}

impl EngineConfig {
    /// The admission queue size used unless configured otherwise.
    pub const DEFAULT_QUEUE_SIZE: NonZeroUsize = NonZeroUsize::new(100).unwrap();

    /// Creates a configuration with the given limits and the default queue size.
    pub fn new(cache_capacity: usize, concurrency_limit: usize) -> Result<Self, ConfigError> {
        let cache_capacity =
            NonZeroUsize::new(cache_capacity).ok_or(ConfigError::ZeroCacheCapacity)?;
        let concurrency_limit = u32::try_from(concurrency_limit)
            .ok()
            .and_then(NonZeroU32::new)
            .ok_or(ConfigError::InvalidConcurrencyLimit(concurrency_limit))?;

        Ok(Self {
            cache_capacity,
            concurrency_limit,
            queue_size: Self::DEFAULT_QUEUE_SIZE,
        })
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_capacity: NonZeroUsize::new(100).unwrap(),
            concurrency_limit: NonZeroU32::new(10).unwrap(),
            queue_size: Self::DEFAULT_QUEUE_SIZE,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Limits of the request engine.
    pub engine: EngineConfig,

    /// The logging configuration.
    pub logging: Logging,

    /// The metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
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
