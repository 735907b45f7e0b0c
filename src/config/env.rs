//! `SPENDTRACE_*` environment variables.
//!
//! Environment variables are read, never written: mutating the process
//! environment is not thread-safe.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;
use url::Url;

use super::{ConfigError, ConfigResult, TrackerConfig, ValidationErrors};

pub const ENV_PREFIX: &str = "SPENDTRACE_";

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Read-only view over prefixed environment variables.
pub struct EnvSource {
    prefix: String,
    lookup: Lookup,
}

impl fmt::Debug for EnvSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvSource")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl Default for EnvSource {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvSource {
    /// Process environment with the `SPENDTRACE_` prefix.
    pub fn new() -> Self {
        Self::prefixed(ENV_PREFIX)
    }

    pub fn prefixed(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            lookup: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Fixed variables instead of the process environment.
    pub fn from_map(vars: HashMap<String, String>) -> Self {
        Self {
            prefix: ENV_PREFIX.to_string(),
            lookup: Box::new(move |key| vars.get(key).cloned()),
        }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(&self.env_key(key))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| ConfigError::invalid(self.env_key(key), e.to_string()))
            })
            .transpose()
    }

    fn millis(&self, key: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(key)?.map(Duration::from_millis))
    }

    fn flag(&self, key: &str) -> ConfigResult<Option<bool>> {
        let Some(raw) = self.get(key) else {
            return Ok(None);
        };
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" | "hard_block" | "enforce" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "alert" | "none" => Ok(Some(false)),
            other => Err(ConfigError::invalid(
                self.env_key(key),
                format!("expected a boolean, got '{other}'"),
            )),
        }
    }

    /// Overlays every variable that is set onto `config`.
    pub fn apply(&self, config: &mut TrackerConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        let mut collect = |result: ConfigResult<()>| {
            if let Err(e) = result {
                errors.push(e);
            }
        };

        collect(self.parse::<Url>("ENDPOINT").map(|v| {
            if let Some(url) = v {
                config.collector.endpoint = url;
            }
        }));
        if let Some(key) = self.get("API_KEY") {
            config.collector.api_key = Some(SecretString::from(key));
        }
        collect(self.millis("FLUSH_INTERVAL_MS").map(|v| {
            if let Some(interval) = v {
                config.flush.interval = interval;
            }
        }));
        collect(self.parse::<usize>("BATCH_SIZE").map(|v| {
            if let Some(size) = v {
                config.flush.batch_size = size;
            }
        }));
        collect(self.parse::<usize>("MAX_BUFFERED").map(|v| {
            if let Some(max) = v {
                config.flush.max_buffered = max;
            }
        }));
        collect(self.flag("CAP_ENFORCEMENT").map(|v| {
            if let Some(enabled) = v {
                config.caps.enabled = enabled;
            }
        }));
        collect(self.millis("CAP_TIMEOUT_MS").map(|v| {
            if let Some(timeout) = v {
                config.caps.timeout = timeout;
            }
        }));
        collect(self.parse::<Url>("PRICING_URL").map(|v| {
            if v.is_some() {
                config.pricing.service_url = v;
            }
        }));
        if let Some(version) = self.get("PRICING_VERSION") {
            config.pricing.version = Some(version);
        }
        if let Some(tenant) = self.get("TENANT_ID") {
            config.tenant_id = Some(tenant);
        }
        if let Some(customer) = self.get("CUSTOMER_ID") {
            config.customer_id = Some(customer);
        }
        if let Some(service) = self.get("SERVICE_NAME") {
            config.service_name = Some(service);
        }
        collect(self.flag("ENABLED").map(|v| {
            if let Some(enabled) = v {
                config.enabled = enabled;
            }
        }));

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(ConfigError::ValidationErrors(ValidationErrors(errors))),
        }
    }
}

impl TrackerConfig {
    /// Defaults overlaid with `SPENDTRACE_*` variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().merge_env()
    }

    /// Overlays `SPENDTRACE_*` variables on this configuration.
    pub fn merge_env(self) -> ConfigResult<Self> {
        self.merge_from(&EnvSource::new())
    }

    pub fn merge_from(mut self, env: &EnvSource) -> ConfigResult<Self> {
        env.apply(&mut self)?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn env(pairs: &[(&str, &str)]) -> EnvSource {
        EnvSource::from_map(
            pairs
                .iter()
                .map(|(k, v)| (format!("{ENV_PREFIX}{k}"), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_overrides_applied() {
        let config = TrackerConfig::default()
            .merge_from(&env(&[
                ("ENDPOINT", "https://collector.example"),
                ("API_KEY", "sk-123"),
                ("FLUSH_INTERVAL_MS", "250"),
                ("BATCH_SIZE", "20"),
                ("CAP_ENFORCEMENT", "hard_block"),
                ("CAP_TIMEOUT_MS", "1500"),
                ("PRICING_VERSION", "2025-06"),
                ("CUSTOMER_ID", "cust_1"),
                ("ENABLED", "yes"),
            ]))
            .unwrap();
        assert_eq!(config.collector.endpoint.as_str(), "https://collector.example/");
        assert_eq!(
            config.collector.api_key.as_ref().unwrap().expose_secret(),
            "sk-123"
        );
        assert_eq!(config.flush.interval, Duration::from_millis(250));
        assert_eq!(config.flush.batch_size, 20);
        assert!(config.caps.enabled);
        assert_eq!(config.caps.timeout, Duration::from_millis(1500));
        assert_eq!(config.pricing.version.as_deref(), Some("2025-06"));
        assert_eq!(config.customer_id.as_deref(), Some("cust_1"));
        assert!(config.enabled);
    }

    #[test]
    fn test_unset_and_blank_leave_defaults() {
        let config = TrackerConfig::default()
            .merge_from(&env(&[("BATCH_SIZE", "  ")]))
            .unwrap();
        assert_eq!(config.flush.batch_size, 50);
        assert!(config.collector.api_key.is_none());
    }

    #[test]
    fn test_invalid_values_reported_with_variable_name() {
        let err = TrackerConfig::default()
            .merge_from(&env(&[("BATCH_SIZE", "many"), ("ENABLED", "maybe")]))
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("SPENDTRACE_BATCH_SIZE"));
        assert!(text.contains("SPENDTRACE_ENABLED"));
    }

    #[test]
    fn test_disable_switch() {
        let config = TrackerConfig::default()
            .merge_from(&env(&[("ENABLED", "0"), ("CAP_ENFORCEMENT", "alert")]))
            .unwrap();
        assert!(!config.enabled);
        assert!(!config.caps.enabled);
    }
}
