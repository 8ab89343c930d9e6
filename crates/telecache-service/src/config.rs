use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
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
    /// The log level for telecache.
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
            prefix: "telecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Retention policy of the on-disk object cache.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum age (by modification time) of a cache file that is still served as a hit.
    ///
    /// Files older than this are removed by the janitor.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,

    /// Upper bound for the total size of the cache directory, in gigabytes (`1024^3` bytes).
    pub max_size_gb: f64,

    /// How often the janitor sweeps the cache.
    ///
    /// A zero interval disables the janitor.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl CacheConfig {
    /// The total size ceiling in bytes.
    pub fn max_size_bytes(&self) -> u64 {
        // negative or NaN values saturate to 0
        (self.max_size_gb * 1024.0 * 1024.0 * 1024.0) as u64
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        let minutes = |var: &str, default: u64| parse_minutes(env::var(var).ok().as_deref(), default);

        Self {
            max_age: minutes("CACHE_MAX_AGE_MINUTES", 10),
            max_size_gb: env::var("CACHE_MAX_SIZE_GB")
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(2.0),
            cleanup_interval: minutes("CACHE_CLEANUP_INTERVAL_MINUTES", 60),
        }
    }
}

/// Parses a whole number of minutes, clamping negative values to zero.
fn parse_minutes(value: Option<&str>, default: u64) -> Duration {
    let minutes = value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|m| m.max(0) as u64)
        .unwrap_or(default);
    Duration::from_secs(minutes.saturating_mul(60))
}

/// Access to the size-limited HTTP bot API.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct BotApiConfig {
    /// Base URL of the bot API, without the `/bot<token>` suffix.
    pub url: String,
    /// The bot token. Defaults to the `TELEGRAM_BOT_TOKEN` environment variable.
    pub token: String,
}

impl Default for BotApiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.telegram.org".into(),
            token: env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default(),
        }
    }
}

/// The session-based transport used for objects the bot API refuses to serve.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Base URL of a self-hosted bot API server which has no download size ceiling.
    ///
    /// When this is not set, the session runtime is not started and oversized objects fail
    /// with a "runtime not started" error.
    pub url: Option<String>,
    /// The bot token for the session. Falls back to [`BotApiConfig::token`] when empty.
    pub token: String,
    /// Maximum number of jobs waiting for the session runtime.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: None,
            token: String::new(),
            queue_capacity: 64,
        }
    }
}

/// See the readme for more information on config values.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the cached objects, one file per object id.
    pub cache_dir: PathBuf,

    /// Host and port to bind the HTTP webserver to.
    pub bind: String,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,

    /// Cache retention.
    pub cache: CacheConfig,

    /// The size-limited HTTP transport.
    pub bot_api: BotApiConfig,

    /// The session-based transport.
    pub session: SessionConfig,

    /// A JSON file mapping object ids to their declared size and mime type.
    pub metadata_index: Option<PathBuf>,

    /// Maximum number of objects cached in the background at the same time.
    pub max_background_downloads: usize,

    /// The timeout for establishing a connection to the bot API.
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// The maximum time a direct bot API download may take.
    ///
    /// Objects served through the bot API are small, session downloads are not bound by this.
    #[serde(with = "humantime_serde")]
    pub max_download_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: PathBuf::from("./cache"),
            bind: "127.0.0.1:5000".to_owned(),
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            cache: CacheConfig::default(),
            bot_api: BotApiConfig::default(),
            session: SessionConfig::default(),
            metadata_index: None,
            max_background_downloads: 16,
            connect_timeout: Duration::from_secs(5),
            max_download_timeout: Duration::from_secs(5 * 60),
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

    /// The token used by the session transport.
    pub fn session_token(&self) -> &str {
        if self.session.token.is_empty() {
            &self.bot_api.token
        } else {
            &self.session.token
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
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
