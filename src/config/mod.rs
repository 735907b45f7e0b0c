//! Tracker configuration.
//!
//! ```rust,no_run
//! use spendtrace::config::TrackerConfig;
//!
//! # fn example() -> Result<(), spendtrace::config::ConfigError> {
//! let config = TrackerConfig::from_file("spendtrace.yaml")?.merge_env()?;
//! config.validate()?;
//! # Ok(())
//! # }
//! ```

mod env;
mod file;

pub use env::{ENV_PREFIX, EnvSource};

use std::time::Duration;

use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use url::Url;

use crate::caps::CircuitConfig;

/// Errors that can occur while loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Invalid configuration value
    #[error("Invalid value for {key}: {message}")]
    InvalidValue {
        /// The offending key
        key: String,
        /// Error message
        message: String,
    },

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML deserialization error
    #[error("YAML error: {0}")]
    Yaml(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Multiple validation errors
    #[error("{0}")]
    ValidationErrors(ValidationErrors),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug)]
pub struct ValidationErrors(pub Vec<ConfigError>);

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation failed: ")?;
        let msgs: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        write!(f, "{}", msgs.join("; "))
    }
}

/// Result type for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Longest cap check the application may be stalled by.
pub const MAX_CAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Durations as integer milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn deserialize_secret<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<SecretString>, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?
        .filter(|s| !s.is_empty())
        .map(SecretString::from))
}

fn default_endpoint() -> Url {
    Url::parse("http://localhost:8000").unwrap_or_else(|_| unreachable!())
}

/// Collector endpoints and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    pub endpoint: Url,
    #[serde(deserialize_with = "deserialize_secret")]
    pub api_key: Option<SecretString>,
    pub ingest_path: String,
    pub cap_check_path: String,
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            api_key: None,
            ingest_path: "/api/events/batch".to_string(),
            cap_check_path: "/api/caps/check".to_string(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl CollectorConfig {
    fn join(&self, path: &str) -> ConfigResult<Url> {
        let base = self.endpoint.as_str().trim_end_matches('/');
        let path = path.trim_start_matches('/');
        Url::parse(&format!("{base}/{path}"))
            .map_err(|e| ConfigError::invalid("collector.endpoint", e.to_string()))
    }

    pub fn ingest_url(&self) -> ConfigResult<Url> {
        self.join(&self.ingest_path)
    }

    pub fn cap_check_url(&self) -> ConfigResult<Url> {
        self.join(&self.cap_check_path)
    }
}

/// Event buffering and delivery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    #[serde(with = "duration_ms", rename = "interval_ms")]
    pub interval: Duration,
    /// Buffered events that trigger an early flush; also the batch size.
    pub batch_size: usize,
    /// Events held in memory, queued or in flight; beyond this the oldest
    /// queued event is dropped.
    pub max_buffered: usize,
    #[serde(with = "duration_ms", rename = "backoff_max_ms")]
    pub backoff_max: Duration,
    /// Bound on the final flush during shutdown.
    #[serde(with = "duration_ms", rename = "shutdown_timeout_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
            max_buffered: 10_000,
            backoff_max: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CapGuardConfig {
    /// Hard-block enforcement on/off. Off means no cap requests at all.
    pub enabled: bool,
    #[serde(with = "duration_ms", rename = "timeout_ms")]
    pub timeout: Duration,
    #[serde(with = "duration_ms", rename = "cache_ttl_ms")]
    pub cache_ttl: Duration,
    /// Most cached decisions kept at once; expired ones are purged first.
    pub cache_capacity: usize,
    pub circuit: CircuitConfig,
}

impl Default for CapGuardConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: Duration::from_secs(2),
            cache_ttl: Duration::from_secs(5),
            cache_capacity: 1024,
            circuit: CircuitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PricingConfig {
    /// Pricing service; the built-in table is used alone when unset.
    pub service_url: Option<Url>,
    /// Pinned pricing version.
    pub version: Option<String>,
    #[serde(with = "duration_ms", rename = "refresh_interval_ms")]
    pub refresh_interval: Duration,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            service_url: None,
            version: None,
            refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Top-level tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Master switch. Disabled means calls pass through with no events.
    pub enabled: bool,
    pub service_name: Option<String>,
    pub tenant_id: Option<String>,
    pub customer_id: Option<String>,
    pub collector: CollectorConfig,
    pub flush: FlushConfig,
    pub caps: CapGuardConfig,
    pub pricing: PricingConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: None,
            tenant_id: None,
            customer_id: None,
            collector: CollectorConfig::default(),
            flush: FlushConfig::default(),
            caps: CapGuardConfig::default(),
            pricing: PricingConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.collector.endpoint = endpoint;
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.collector.api_key = Some(SecretString::from(key.into()));
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn tenant_id(mut self, id: impl Into<String>) -> Self {
        self.tenant_id = Some(id.into());
        self
    }

    pub fn customer_id(mut self, id: impl Into<String>) -> Self {
        self.customer_id = Some(id.into());
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush.interval = interval;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.flush.batch_size = size;
        self
    }

    pub fn max_buffered(mut self, max: usize) -> Self {
        self.flush.max_buffered = max;
        self
    }

    pub fn cap_enforcement(mut self, enabled: bool) -> Self {
        self.caps.enabled = enabled;
        self
    }

    pub fn cap_timeout(mut self, timeout: Duration) -> Self {
        self.caps.timeout = timeout;
        self
    }

    pub fn pricing_service(mut self, url: Url) -> Self {
        self.pricing.service_url = Some(url);
        self
    }

    pub fn pricing_version(mut self, version: impl Into<String>) -> Self {
        self.pricing.version = Some(version.into());
        self
    }

    /// Checks every constraint and reports all violations together.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut errors = Vec::new();

        if self.flush.batch_size == 0 {
            errors.push(ConfigError::invalid("flush.batch_size", "must be greater than 0"));
        }
        if self.flush.interval.is_zero() {
            errors.push(ConfigError::invalid("flush.interval_ms", "must be greater than 0"));
        }
        if self.flush.max_buffered < self.flush.batch_size {
            errors.push(ConfigError::invalid(
                "flush.max_buffered",
                format!(
                    "must be at least batch_size ({}), got {}",
                    self.flush.batch_size, self.flush.max_buffered
                ),
            ));
        }
        if self.caps.timeout > MAX_CAP_TIMEOUT {
            errors.push(ConfigError::invalid(
                "caps.timeout_ms",
                format!("must not exceed {} ms", MAX_CAP_TIMEOUT.as_millis()),
            ));
        }
        if self.caps.timeout.is_zero() {
            errors.push(ConfigError::invalid("caps.timeout_ms", "must be greater than 0"));
        }
        if let Err(e) = self.collector.ingest_url() {
            errors.push(e);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }
}
