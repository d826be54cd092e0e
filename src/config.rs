//! Engine and per-consumer configuration.
//!
//! [`EngineConfig`] holds the process-wide knobs (Redis location, key
//! namespace, sweep intervals, lock TTL). [`ConsumerSettings`] holds what each
//! consumer asks of its groups (thresholds, interval, dedup, reliability),
//! and [`ConsumerRegistry`] maps consumer identities to their settings.
//!
//! Both are passed explicitly into [`crate::grouping::Grouping`]; nothing is
//! read from global state after startup.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default Redis URL.
pub const DEFAULT_REDIS_URL: &str = "redis://localhost:6379";

/// Default key namespace.
pub const DEFAULT_NAMESPACE: &str = "batching";

/// Default extraction size for consumers without a flush threshold.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

/// Default time an unacknowledged pending dispatch lives before revival.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(3600);

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Consumer file could not be parsed.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix for every key the engine touches.
    pub namespace: String,
    /// How often the flush sweeper runs.
    pub poll_interval: Duration,
    /// How often the revival sweeper runs.
    pub revival_interval: Duration,
    /// Extraction size for consumers that do not set a flush threshold.
    pub max_batch_size: usize,
    /// Expiry of the per-group flush lock.
    pub lock_ttl: Duration,
    /// Whether groups use reliable extraction unless their consumer says otherwise.
    pub reliable: bool,
    /// Marks the process as a test environment (silences force-flush warnings).
    pub tests_env: bool,
    /// Timeout for graceful supervisor shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redis_url: DEFAULT_REDIS_URL.to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            poll_interval: Duration::from_secs(3),
            revival_interval: Duration::from_secs(60),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            lock_ttl: Duration::from_secs(1),
            reliable: false,
            tests_env: false,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GROUPING_REDIS_URL` (falls back to `REDIS_URL`): Redis URL
    /// - `GROUPING_NAMESPACE`: key prefix (default: batching)
    /// - `GROUPING_POLL_INTERVAL_SECS`: flush sweep interval (default: 3)
    /// - `GROUPING_REVIVAL_INTERVAL_SECS`: revival sweep interval (default: 60)
    /// - `GROUPING_MAX_BATCH_SIZE`: default extraction size (default: 1000)
    /// - `GROUPING_LOCK_TTL_SECS`: flush lock expiry (default: 1)
    /// - `GROUPING_RELIABLE`: reliable extraction by default (default: false)
    /// - `GROUPING_TESTS_ENV`: test environment flag (default: false)
    /// - `GROUPING_SHUTDOWN_TIMEOUT_SECS`: supervisor shutdown timeout (default: 30)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(val) = lookup("GROUPING_REDIS_URL").or_else(|| lookup("REDIS_URL")) {
            config.redis_url = val;
        }

        if let Some(val) = lookup("GROUPING_NAMESPACE") {
            config.namespace = val;
        }

        if let Some(val) = lookup("GROUPING_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "GROUPING_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("GROUPING_REVIVAL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "GROUPING_REVIVAL_INTERVAL_SECS")?;
            config.revival_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("GROUPING_MAX_BATCH_SIZE") {
            config.max_batch_size = parse_env_value(&val, "GROUPING_MAX_BATCH_SIZE")?;
        }

        if let Some(val) = lookup("GROUPING_LOCK_TTL_SECS") {
            let secs: u64 = parse_env_value(&val, "GROUPING_LOCK_TTL_SECS")?;
            config.lock_ttl = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("GROUPING_RELIABLE") {
            config.reliable = parse_env_bool(&val, "GROUPING_RELIABLE")?;
        }

        if let Some(val) = lookup("GROUPING_TESTS_ENV") {
            config.tests_env = parse_env_bool(&val, "GROUPING_TESTS_ENV")?;
        }

        if let Some(val) = lookup("GROUPING_SHUTDOWN_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "GROUPING_SHUTDOWN_TIMEOUT_SECS")?;
            config.shutdown_timeout = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.revival_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "revival_interval must be greater than 0".to_string(),
            ));
        }

        if self.max_batch_size == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_batch_size must be greater than 0".to_string(),
            ));
        }

        if self.lock_ttl.as_millis() == 0 {
            return Err(ConfigError::ValidationFailed(
                "lock_ttl must be at least 1ms".to_string(),
            ));
        }

        Ok(())
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the key namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the flush sweep interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the revival sweep interval.
    pub fn with_revival_interval(mut self, interval: Duration) -> Self {
        self.revival_interval = interval;
        self
    }

    /// Sets the default extraction size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the flush lock TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Enables or disables reliable extraction by default.
    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = reliable;
        self
    }

    /// Marks the process as a test environment.
    pub fn with_tests_env(mut self, tests_env: bool) -> Self {
        self.tests_env = tests_env;
        self
    }

    /// Sets the supervisor shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// What a consumer asks of its groups.
///
/// Durations are expressed in whole seconds so the struct maps directly onto
/// the consumer file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Group size that makes a group eligible, and the extraction size of a flush.
    pub flush_threshold: Option<usize>,
    /// Maximum size of one dispatched chunk (defaults to the flush threshold).
    pub dispatch_chunk_size: Option<usize>,
    /// Seconds between time-based flushes.
    pub flush_interval_secs: Option<u64>,
    /// Reject messages whose serialized form is already waiting.
    pub dedup: bool,
    /// Overrides the engine-wide reliability default.
    pub reliable: Option<bool>,
    /// Seconds before an unacknowledged pending dispatch is revived.
    pub pending_ttl_secs: Option<u64>,
    /// Submissions carry a whole array of messages to merge at once.
    pub bulk_merge: bool,
}

impl ConsumerSettings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether submissions for this consumer are diverted into groups at all.
    pub fn is_grouped(&self) -> bool {
        self.flush_threshold.is_some()
            || self.flush_interval_secs.is_some()
            || self.dispatch_chunk_size.is_some()
    }

    pub fn flush_interval(&self) -> Option<Duration> {
        self.flush_interval_secs.map(Duration::from_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        self.pending_ttl_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_PENDING_TTL)
    }

    /// Resolves the settings against engine defaults into concrete values.
    pub fn resolve(&self, engine: &EngineConfig) -> GroupPolicy {
        let flush_threshold = self.flush_threshold.unwrap_or(engine.max_batch_size);
        GroupPolicy {
            flush_threshold,
            dispatch_chunk_size: self.dispatch_chunk_size.unwrap_or(flush_threshold),
            flush_interval: self.flush_interval(),
            dedup: self.dedup,
            reliable: self.reliable.unwrap_or(engine.reliable),
            pending_ttl: self.pending_ttl(),
            lock_ttl: engine.lock_ttl,
        }
    }

    /// Validates the settings.
    pub fn validate(&self, consumer: &str) -> Result<(), ConfigError> {
        let invalid = |field: &str| -> Result<(), ConfigError> {
            Err(ConfigError::ValidationFailed(format!(
                "{} for consumer '{}' must be greater than 0",
                field, consumer
            )))
        };

        if self.flush_threshold == Some(0) {
            return invalid("flush_threshold");
        }
        if self.dispatch_chunk_size == Some(0) {
            return invalid("dispatch_chunk_size");
        }
        if self.flush_interval_secs == Some(0) {
            return invalid("flush_interval_secs");
        }
        if self.pending_ttl_secs == Some(0) {
            return invalid("pending_ttl_secs");
        }
        Ok(())
    }

    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = Some(threshold);
        self
    }

    pub fn with_dispatch_chunk_size(mut self, size: usize) -> Self {
        self.dispatch_chunk_size = Some(size);
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_secs = Some(interval.as_secs());
        self
    }

    pub fn with_dedup(mut self, dedup: bool) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_reliable(mut self, reliable: bool) -> Self {
        self.reliable = Some(reliable);
        self
    }

    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl_secs = Some(ttl.as_secs());
        self
    }

    pub fn with_bulk_merge(mut self, bulk_merge: bool) -> Self {
        self.bulk_merge = bulk_merge;
        self
    }
}

/// Concrete, fully-defaulted settings for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupPolicy {
    pub flush_threshold: usize,
    pub dispatch_chunk_size: usize,
    pub flush_interval: Option<Duration>,
    pub dedup: bool,
    pub reliable: bool,
    pub pending_ttl: Duration,
    pub lock_ttl: Duration,
}

/// On-disk layout of the consumer file.
#[derive(Debug, Default, Deserialize)]
struct ConsumerFile {
    #[serde(default)]
    consumers: HashMap<String, ConsumerSettings>,
}

/// Maps consumer identities to their settings.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    consumers: HashMap<String, ConsumerSettings>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the settings of a consumer.
    pub fn register(&mut self, consumer: impl Into<String>, settings: ConsumerSettings) {
        self.consumers.insert(consumer.into(), settings);
    }

    /// Builder form of [`ConsumerRegistry::register`].
    pub fn with_consumer(mut self, consumer: impl Into<String>, settings: ConsumerSettings) -> Self {
        self.register(consumer, settings);
        self
    }

    /// Settings of a known consumer.
    pub fn get(&self, consumer: &str) -> Option<&ConsumerSettings> {
        self.consumers.get(consumer)
    }

    /// Settings of a consumer, or defaults when it is unknown.
    pub fn settings_for(&self, consumer: &str) -> ConsumerSettings {
        self.consumers.get(consumer).cloned().unwrap_or_default()
    }

    /// Whether any registered consumer, or the engine default, uses reliable extraction.
    pub fn reliability_in_use(&self, engine: &EngineConfig) -> bool {
        engine.reliable || self.consumers.values().any(|s| s.reliable == Some(true))
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// Parses a consumer file.
    ///
    /// ```yaml
    /// consumers:
    ///   mailer:
    ///     flush_threshold: 100
    ///     flush_interval_secs: 60
    ///     dedup: true
    /// ```
    pub fn from_yaml_str(content: &str) -> Result<Self, ConfigError> {
        let file: ConsumerFile = serde_yaml::from_str(content)?;
        for (consumer, settings) in &file.consumers {
            settings.validate(consumer)?;
        }
        Ok(Self {
            consumers: file.consumers,
        })
    }

    /// Loads a consumer file from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }
}

/// Parse an environment variable value into the target type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();

        assert_eq!(config.redis_url, "redis://localhost:6379");
        assert_eq!(config.namespace, "batching");
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.max_batch_size, 1000);
        assert_eq!(config.lock_ttl, Duration::from_secs(1));
        assert!(!config.reliable);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_from_lookup() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://fallback:6379"),
            ("GROUPING_NAMESPACE", "grp"),
            ("GROUPING_POLL_INTERVAL_SECS", "10"),
            ("GROUPING_RELIABLE", "yes"),
            ("GROUPING_MAX_BATCH_SIZE", "250"),
        ]))
        .expect("config should parse");

        assert_eq!(config.redis_url, "redis://fallback:6379");
        assert_eq!(config.namespace, "grp");
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert!(config.reliable);
        assert_eq!(config.max_batch_size, 250);
    }

    #[test]
    fn test_engine_config_prefers_grouping_redis_url() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            ("REDIS_URL", "redis://fallback:6379"),
            ("GROUPING_REDIS_URL", "redis://primary:6379"),
        ]))
        .expect("config should parse");

        assert_eq!(config.redis_url, "redis://primary:6379");
    }

    #[test]
    fn test_engine_config_invalid_values() {
        let err = EngineConfig::from_lookup(lookup_from(&[("GROUPING_RELIABLE", "maybe")]))
            .expect_err("should reject");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let err = EngineConfig::from_lookup(lookup_from(&[("GROUPING_MAX_BATCH_SIZE", "0")]))
            .expect_err("should reject");
        assert!(matches!(err, ConfigError::ValidationFailed(_)));
    }

    #[test]
    fn test_consumer_settings_resolve_defaults() {
        let engine = EngineConfig::default();
        let policy = ConsumerSettings::new().resolve(&engine);

        assert_eq!(policy.flush_threshold, 1000);
        assert_eq!(policy.dispatch_chunk_size, 1000);
        assert_eq!(policy.flush_interval, None);
        assert_eq!(policy.pending_ttl, Duration::from_secs(3600));
        assert!(!policy.reliable);
        assert!(!policy.dedup);
    }

    #[test]
    fn test_consumer_settings_resolve_overrides() {
        let engine = EngineConfig::default().with_reliable(true);
        let policy = ConsumerSettings::new()
            .with_flush_threshold(10)
            .with_flush_interval(Duration::from_secs(60))
            .with_dedup(true)
            .resolve(&engine);

        assert_eq!(policy.flush_threshold, 10);
        assert_eq!(policy.dispatch_chunk_size, 10);
        assert_eq!(policy.flush_interval, Some(Duration::from_secs(60)));
        assert!(policy.reliable);
        assert!(policy.dedup);

        let policy = ConsumerSettings::new()
            .with_flush_threshold(10)
            .with_dispatch_chunk_size(2)
            .with_reliable(false)
            .resolve(&engine);
        assert_eq!(policy.dispatch_chunk_size, 2);
        assert!(!policy.reliable);
    }

    #[test]
    fn test_consumer_settings_is_grouped() {
        assert!(!ConsumerSettings::new().with_dedup(true).is_grouped());
        assert!(ConsumerSettings::new().with_flush_threshold(5).is_grouped());
        assert!(ConsumerSettings::new()
            .with_flush_interval(Duration::from_secs(5))
            .is_grouped());
        assert!(ConsumerSettings::new().with_dispatch_chunk_size(5).is_grouped());
    }

    #[test]
    fn test_registry_from_yaml() {
        let registry = ConsumerRegistry::from_yaml_str(
            r#"
consumers:
  mailer:
    flush_threshold: 100
    flush_interval_secs: 60
    dedup: true
  audit:
    flush_threshold: 5
    reliable: true
    pending_ttl_secs: 120
"#,
        )
        .expect("yaml should parse");

        assert_eq!(registry.len(), 2);
        let mailer = registry.get("mailer").expect("mailer registered");
        assert_eq!(mailer.flush_threshold, Some(100));
        assert_eq!(mailer.flush_interval(), Some(Duration::from_secs(60)));
        assert!(mailer.dedup);

        let audit = registry.settings_for("audit");
        assert_eq!(audit.pending_ttl(), Duration::from_secs(120));
        assert!(registry.reliability_in_use(&EngineConfig::default()));

        assert_eq!(registry.settings_for("unknown"), ConsumerSettings::default());
    }

    #[test]
    fn test_registry_rejects_zero_threshold() {
        let err = ConsumerRegistry::from_yaml_str("consumers:\n  bad:\n    flush_threshold: 0\n")
            .expect_err("should reject");
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_registry_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "consumers:\n  mailer:\n    flush_threshold: 3").expect("write");

        let registry = ConsumerRegistry::from_file(file.path()).expect("file should load");
        assert_eq!(
            registry.get("mailer").and_then(|s| s.flush_threshold),
            Some(3)
        );
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "K").expect("bool"));
        assert!(parse_env_bool("ON", "K").expect("bool"));
        assert!(!parse_env_bool("0", "K").expect("bool"));
        assert!(parse_env_bool("nah", "K").is_err());
    }
}
