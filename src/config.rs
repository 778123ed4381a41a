//! Configuration types for stream-harvest

use crate::error::{Error, Result};
use crate::pool::ProtocolKind;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};

/// Top-level configuration
///
/// Every field has a default, so `Config::default()` is a working setup that
/// stores state in `./data/harvest.db`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Page fetching and engine policy
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Throttle handling
    #[serde(default)]
    pub backoff: BackoffConfig,

    /// Route selection preferences and health policy
    #[serde(default)]
    pub pool: PoolConfig,

    /// Media download workers
    #[serde(default)]
    pub media: MediaConfig,

    /// Data storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl Config {
    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.collection.page_size == 0 {
            return Err(config_error("page_size must be at least 1", "collection.page_size"));
        }
        if self.collection.max_concurrent_targets == 0 {
            return Err(config_error(
                "max_concurrent_targets must be at least 1",
                "collection.max_concurrent_targets",
            ));
        }
        if self.backoff.rotation_threshold == 0 {
            return Err(config_error(
                "rotation_threshold must be at least 1",
                "backoff.rotation_threshold",
            ));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(config_error(
                "multiplier must be at least 1.0",
                "backoff.multiplier",
            ));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(config_error(
                "base_delay must not exceed max_delay",
                "backoff.base_delay",
            ));
        }
        if self.media.concurrency == 0 {
            return Err(config_error("concurrency must be at least 1", "media.concurrency"));
        }
        Ok(())
    }
}

fn config_error(message: &str, key: &str) -> Error {
    Error::Config {
        message: message.to_string(),
        key: Some(key.to_string()),
    }
}

/// Page fetching and failure policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Items requested per page, independent of the caller's limit (default: 100)
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Retryable transport failures tolerated per page before giving up (default: 3)
    #[serde(default = "default_max_transport_retries")]
    pub max_transport_retries: u32,

    /// Fall back to a direct connection when no route is usable (default: true)
    #[serde(default = "default_true")]
    pub allow_direct: bool,

    /// Targets collected concurrently by `collect_all` (default: 4)
    #[serde(default = "default_max_concurrent_targets")]
    pub max_concurrent_targets: usize,

    /// Minimum spacing between page requests of one session (default: 500ms, 0 = off)
    #[serde(default = "default_min_request_interval", with = "duration_millis_serde")]
    pub min_request_interval: Duration,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            max_transport_retries: default_max_transport_retries(),
            allow_direct: true,
            max_concurrent_targets: default_max_concurrent_targets(),
            min_request_interval: default_min_request_interval(),
        }
    }
}

/// Throttle backoff policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First wait when the remote gives no retry-after (default: 1 second)
    #[serde(default = "default_base_delay", with = "duration_serde")]
    pub base_delay: Duration,

    /// Ceiling for the exponential wait (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Growth factor per consecutive throttle (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,

    /// Add random jitter to waits (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,

    /// Upper bound of the jitter added to any wait (default: 1 second)
    #[serde(default = "default_max_jitter", with = "duration_millis_serde")]
    pub max_jitter: Duration,

    /// Consecutive throttles on one route before rotating (default: 2)
    #[serde(default = "default_rotation_threshold")]
    pub rotation_threshold: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            multiplier: default_backoff_multiplier(),
            jitter: true,
            max_jitter: default_max_jitter(),
            rotation_threshold: default_rotation_threshold(),
        }
    }
}

/// Route selection preferences
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Protocols preferred when selecting a route (default: socks5, socks4)
    #[serde(default = "default_preferred_protocols")]
    pub preferred_protocols: Vec<ProtocolKind>,

    /// ISO country codes preferred when selecting a route (default: any)
    #[serde(default)]
    pub preferred_countries: Vec<String>,

    /// How long a repeatedly failing but otherwise healthy route sits out (default: 60 seconds)
    #[serde(default = "default_quarantine_period", with = "duration_serde")]
    pub quarantine_period: Duration,

    /// Idle time after which a route gets the full load-spreading bonus (default: 30 seconds)
    #[serde(default = "default_idle_horizon", with = "duration_serde")]
    pub idle_horizon: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            preferred_protocols: default_preferred_protocols(),
            preferred_countries: Vec::new(),
            quarantine_period: default_quarantine_period(),
            idle_horizon: default_idle_horizon(),
        }
    }
}

/// Retry configuration for transient media download failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 2 seconds)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Media download workers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Parallel download workers (default: 3)
    #[serde(default = "default_media_concurrency")]
    pub concurrency: usize,

    /// Files larger than this are skipped (default: 100 MiB)
    #[serde(default = "default_max_media_size")]
    pub max_size_bytes: u64,

    /// Directory media is written to; one subdirectory per target (default: "./data/media")
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Retry policy for individual downloads
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            concurrency: default_media_concurrency(),
            max_size_bytes: default_max_media_size(),
            media_dir: default_media_dir(),
            retry: RetryConfig::default(),
        }
    }
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database holding checkpoints, continuity ledger, manifests and items
    /// (default: "./data/harvest.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    100
}

fn default_max_transport_retries() -> u32 {
    3
}

fn default_max_concurrent_targets() -> usize {
    4
}

fn default_min_request_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_base_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_jitter() -> Duration {
    Duration::from_secs(1)
}

fn default_rotation_threshold() -> u32 {
    2
}

fn default_preferred_protocols() -> Vec<ProtocolKind> {
    vec![ProtocolKind::Socks5, ProtocolKind::Socks4]
}

fn default_quarantine_period() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_horizon() -> Duration {
    Duration::from_secs(30)
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_media_concurrency() -> usize {
    3
}

fn default_max_media_size() -> u64 {
    100 * 1024 * 1024
}

fn default_media_dir() -> PathBuf {
    PathBuf::from("./data/media")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/harvest.db")
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Duration serialization helper (milliseconds, for sub-second settings)
mod duration_millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.collection.page_size, 100);
        assert_eq!(config.backoff.rotation_threshold, 2);
        assert_eq!(config.media.concurrency, 3);
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.collection.min_request_interval, Duration::from_millis(500));
        assert_eq!(config.backoff.max_delay, Duration::from_secs(60));
        assert_eq!(
            config.pool.preferred_protocols,
            vec![ProtocolKind::Socks5, ProtocolKind::Socks4]
        );
    }

    #[test]
    fn test_partial_json_overrides() {
        let config: Config = serde_json::from_str(
            r#"{
                "collection": { "page_size": 50, "allow_direct": false },
                "backoff": { "base_delay": 2, "max_jitter": 250 },
                "pool": { "preferred_countries": ["DE", "NL"] }
            }"#,
        )
        .unwrap();
        assert_eq!(config.collection.page_size, 50);
        assert!(!config.collection.allow_direct);
        assert_eq!(config.backoff.base_delay, Duration::from_secs(2));
        assert_eq!(config.backoff.max_jitter, Duration::from_millis(250));
        assert_eq!(config.pool.preferred_countries, vec!["DE", "NL"]);
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let mut config = Config::default();
        config.collection.page_size = 0;
        match config.validate() {
            Err(Error::Config { key, .. }) => {
                assert_eq!(key.as_deref(), Some("collection.page_size"))
            }
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_inverted_delays() {
        let mut config = Config::default();
        config.backoff.base_delay = Duration::from_secs(120);
        assert!(config.validate().is_err());
    }
}
