//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{LimiterConfig, DEFAULT_KEY_PREFIX, DEFAULT_MAX_RETRIES};

/// Prefix for environment overrides, e.g. `TURNSTILE__LIMITER__CAPACITY=10`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    /// Bucket parameters
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Shared state store
    #[serde(default)]
    pub store: StoreSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Bucket parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum tokens per client
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate_per_second: f64,

    /// Bound on optimistic-conflict retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Namespace for state keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate_per_second: default_refill_rate(),
            max_retries: default_max_retries(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_capacity() -> u64 {
    5
}

fn default_refill_rate() -> f64 {
    2.0
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Which store implementation to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, shared only by limiters in this process
    #[default]
    Memory,
    /// Redis, shared by every process that can reach it
    Redis,
}

/// Shared state store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Timeout for each store round-trip in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// Expire idle client state after this many seconds
    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            operation_timeout_ms: default_operation_timeout(),
            idle_ttl_secs: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Settings {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Load configuration from an optional file, then apply environment
    /// overrides of the form `TURNSTILE__SECTION__FIELD`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(::config::File::from(path).required(true));
        }

        builder
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TurnstileError::Config(e.to_string()))
    }

    /// Validated limiter parameters.
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        let config = LimiterConfig::new(self.limiter.capacity, self.limiter.refill_rate_per_second)
            .with_max_retries(self.limiter.max_retries)
            .with_key_prefix(self.limiter.key_prefix.clone());
        config.validate()?;
        Ok(config)
    }

    /// Expiry for idle client state, if configured.
    ///
    /// The expiry must not be shorter than the time an empty bucket takes to
    /// refill completely: a key dropped earlier than that is recreated as a
    /// full bucket and hands out more tokens than the elapsed time earned.
    pub fn idle_ttl(&self) -> Result<Option<Duration>> {
        let Some(secs) = self.store.idle_ttl_secs else {
            return Ok(None);
        };

        let full_refill_secs =
            self.limiter.capacity as f64 / self.limiter.refill_rate_per_second;
        if (secs as f64) < full_refill_secs {
            return Err(TurnstileError::InvalidConfiguration(format!(
                "idle_ttl_secs ({}) is shorter than a full refill ({:.3}s for capacity {} at {}/s)",
                secs,
                full_refill_secs,
                self.limiter.capacity,
                self.limiter.refill_rate_per_second
            )));
        }
        Ok(Some(Duration::from_secs(secs)))
    }

    /// Connection settings for the Redis store.
    #[cfg(feature = "redis")]
    pub fn redis_config(&self) -> Result<crate::store::RedisStoreConfig> {
        Ok(crate::store::RedisStoreConfig {
            url: self.store.redis_url.clone(),
            operation_timeout: Duration::from_millis(self.store.operation_timeout_ms),
            idle_ttl: self.idle_ttl()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.limiter.capacity, 5);
        assert_eq!(settings.limiter.refill_rate_per_second, 2.0);
        assert_eq!(settings.limiter.max_retries, 5);
        assert_eq!(settings.limiter.key_prefix, "rate_limit");
        assert_eq!(settings.store.backend, StoreBackend::Memory);
        assert_eq!(settings.store.operation_timeout_ms, 250);
        assert_eq!(settings.logging.level, "info");
        assert!(!settings.logging.json);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
limiter:
  capacity: 100
  refill_rate_per_second: 12.5
  max_retries: 8
  key_prefix: api
store:
  backend: redis
  redis_url: redis://cache:6379/1
  operation_timeout_ms: 100
  idle_ttl_secs: 3600
logging:
  level: debug
  json: true
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.limiter.capacity, 100);
        assert_eq!(settings.limiter.refill_rate_per_second, 12.5);
        assert_eq!(settings.limiter.max_retries, 8);
        assert_eq!(settings.limiter.key_prefix, "api");
        assert_eq!(settings.store.backend, StoreBackend::Redis);
        assert_eq!(settings.store.redis_url, "redis://cache:6379/1");
        assert_eq!(settings.store.idle_ttl_secs, Some(3600));
        assert!(settings.logging.json);
    }

    #[test]
    fn test_parse_partial_config_fills_defaults() {
        let yaml = r#"
limiter:
  capacity: 20
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.limiter.capacity, 20);
        assert_eq!(settings.limiter.refill_rate_per_second, 2.0);
        assert_eq!(settings.store, StoreSettings::default());
        assert_eq!(settings.logging, LoggingSettings::default());
    }

    #[test]
    fn test_parse_invalid_config() {
        let result = Settings::from_yaml("store:\n  backend: etcd\n");
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_limiter_config_conversion() {
        let settings = Settings::from_yaml("limiter:\n  capacity: 7\n  max_retries: 2\n").unwrap();
        let config = settings.limiter_config().unwrap();
        assert_eq!(config, LimiterConfig::new(7, 2.0).with_max_retries(2));
    }

    #[test]
    fn test_limiter_config_rejects_invalid_values() {
        let settings = Settings::from_yaml("limiter:\n  refill_rate_per_second: 0\n").unwrap();
        assert!(matches!(
            settings.limiter_config(),
            Err(TurnstileError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_idle_ttl_unset() {
        assert_eq!(Settings::default().idle_ttl().unwrap(), None);
    }

    #[test]
    fn test_idle_ttl_covering_full_refill_accepted() {
        let yaml = r#"
limiter:
  capacity: 100
  refill_rate_per_second: 1
store:
  idle_ttl_secs: 100
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert_eq!(settings.idle_ttl().unwrap(), Some(Duration::from_secs(100)));
    }

    #[test]
    fn test_idle_ttl_shorter_than_full_refill_rejected() {
        // An exhausted bucket expiring after 10s would come back with 100
        // tokens when only 10 were earned.
        let yaml = r#"
limiter:
  capacity: 100
  refill_rate_per_second: 1
store:
  idle_ttl_secs: 10
"#;
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(matches!(
            settings.idle_ttl(),
            Err(TurnstileError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_idle_ttl_rounds_fractional_refill_up() {
        let yaml = r#"
limiter:
  capacity: 5
  refill_rate_per_second: 2
store:
  idle_ttl_secs: 2
"#;
        // Full refill takes 2.5s
        let settings = Settings::from_yaml(yaml).unwrap();
        assert!(settings.idle_ttl().is_err());
    }

    #[test]
    fn test_load_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("turnstile-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "limiter:\n  capacity: 9\n  refill_rate_per_second: 1.5\n").unwrap();

        std::env::set_var("TURNSTILE__LIMITER__MAX_RETRIES", "11");
        let settings = Settings::load(Some(&path));
        std::env::remove_var("TURNSTILE__LIMITER__MAX_RETRIES");
        std::fs::remove_file(&path).unwrap();

        let settings = settings.unwrap();
        assert_eq!(settings.limiter.capacity, 9);
        assert_eq!(settings.limiter.refill_rate_per_second, 1.5);
        assert_eq!(settings.limiter.max_retries, 11);
        assert_eq!(settings.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Settings::load(Some(Path::new("/nonexistent/turnstile.yaml")));
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            Settings::from_file("/nonexistent/turnstile.yaml"),
            Err(TurnstileError::Io(_))
        ));
    }
}
