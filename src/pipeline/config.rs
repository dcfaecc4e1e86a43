//! Pipeline configuration.
//!
//! Configuration is assembled in layers: built-in defaults, then an optional
//! YAML file, then `WORKLINE_*` environment variables. Durations are written
//! as integer milliseconds (`*_ms` keys) in both the file and the environment.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::retry::{RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_DELAY};

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable or file entry has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// IO error while reading configuration.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// How workers pick the next task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// Priority class first, arrival order within a class.
    #[default]
    Priority,
    /// Arrival order only; every task is scheduled as `Normal`.
    Fifo,
}

impl fmt::Display for SchedulingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulingMode::Priority => write!(f, "priority"),
            SchedulingMode::Fifo => write!(f, "fifo"),
        }
    }
}

impl FromStr for SchedulingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "priority" => Ok(SchedulingMode::Priority),
            "fifo" => Ok(SchedulingMode::Fifo),
            other => Err(format!("unknown scheduling mode '{}'", other)),
        }
    }
}

/// Default retry behaviour for submitted tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts per task, including the first.
    pub max_attempts: u32,
    /// Delay before a failed task is re-offered to the scheduler.
    #[serde(rename = "delay_ms", with = "millis")]
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

impl RetryConfig {
    /// Builds the policy used for tasks submitted without an explicit one.
    pub fn to_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, self.delay)
    }
}

/// Configuration for a pipeline controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Slots in the bounded buffer between producers and workers.
    pub buffer_capacity: usize,
    /// Admission permits, bounding in-flight work.
    pub permit_count: usize,
    /// Number of worker tasks.
    pub worker_count: usize,
    /// Default retry policy.
    pub retry: RetryConfig,
    /// Default bound for `get_result` when the caller passes none.
    #[serde(rename = "result_timeout_ms", with = "millis")]
    pub result_timeout: Duration,
    /// Scheduling discipline.
    pub scheduling: SchedulingMode,
    /// Drain bound used by `shutdown_timeout` before escalating.
    #[serde(rename = "shutdown_timeout_ms", with = "millis")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 64,
            permit_count: 16,
            worker_count: 4,
            retry: RetryConfig::default(),
            result_timeout: Duration::from_secs(30),
            scheduling: SchedulingMode::Priority,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl PipelineConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a YAML file; keys it omits keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parses YAML text; keys it omits keep their defaults.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `WORKLINE_BUFFER_CAPACITY`: Buffer slots (default: 64)
    /// - `WORKLINE_PERMITS`: Admission permits (default: 16)
    /// - `WORKLINE_WORKERS`: Worker count (default: 4)
    /// - `WORKLINE_RETRY_MAX_ATTEMPTS`: Attempts per task (default: 3)
    /// - `WORKLINE_RETRY_DELAY_MS`: Delay between attempts (default: 100)
    /// - `WORKLINE_RESULT_TIMEOUT_MS`: Default result timeout (default: 30000)
    /// - `WORKLINE_SCHEDULING`: `priority` or `fifo` (default: priority)
    /// - `WORKLINE_SHUTDOWN_TIMEOUT_MS`: Drain bound (default: 30000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env(|key| std::env::var(key).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().apply_env(lookup)
    }

    /// Layers the environment over the file at `path` (if given) over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        base.apply_env(|key| std::env::var(key).ok())
    }

    /// Overrides fields with any `WORKLINE_*` variables `lookup` returns.
    pub fn apply_env<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("WORKLINE_BUFFER_CAPACITY") {
            self.buffer_capacity = parse_env_value(&val, "WORKLINE_BUFFER_CAPACITY")?;
        }

        if let Some(val) = lookup("WORKLINE_PERMITS") {
            self.permit_count = parse_env_value(&val, "WORKLINE_PERMITS")?;
        }

        if let Some(val) = lookup("WORKLINE_WORKERS") {
            self.worker_count = parse_env_value(&val, "WORKLINE_WORKERS")?;
        }

        if let Some(val) = lookup("WORKLINE_RETRY_MAX_ATTEMPTS") {
            self.retry.max_attempts = parse_env_value(&val, "WORKLINE_RETRY_MAX_ATTEMPTS")?;
        }

        if let Some(val) = lookup("WORKLINE_RETRY_DELAY_MS") {
            let ms: u64 = parse_env_value(&val, "WORKLINE_RETRY_DELAY_MS")?;
            self.retry.delay = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("WORKLINE_RESULT_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "WORKLINE_RESULT_TIMEOUT_MS")?;
            self.result_timeout = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("WORKLINE_SCHEDULING") {
            self.scheduling = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "WORKLINE_SCHEDULING".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("WORKLINE_SHUTDOWN_TIMEOUT_MS") {
            let ms: u64 = parse_env_value(&val, "WORKLINE_SHUTDOWN_TIMEOUT_MS")?;
            self.shutdown_timeout = Duration::from_millis(ms);
        }

        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::ValidationFailed(
                "buffer_capacity must be greater than 0".to_string(),
            ));
        }

        if self.permit_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "permit_count must be greater than 0".to_string(),
            ));
        }

        if self.worker_count == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_count must be greater than 0".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.result_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "result_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Renders the configuration as YAML.
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Builder method to set buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Builder method to set the admission permit count.
    pub fn with_permit_count(mut self, permits: usize) -> Self {
        self.permit_count = permits;
        self
    }

    /// Builder method to set the worker count.
    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    /// Builder method to set the default retry policy.
    pub fn with_retry(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.retry = RetryConfig {
            max_attempts,
            delay,
        };
        self
    }

    /// Builder method to set the default result timeout.
    pub fn with_result_timeout(mut self, timeout: Duration) -> Self {
        self.result_timeout = timeout;
        self
    }

    /// Builder method to set the scheduling mode.
    pub fn with_scheduling(mut self, mode: SchedulingMode) -> Self {
        self.scheduling = mode;
        self
    }

    /// Builder method to set the drain bound.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Serde adapter storing a `Duration` as integer milliseconds.
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.buffer_capacity, 64);
        assert_eq!(config.permit_count, 16);
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_millis(100));
        assert_eq!(config.result_timeout, Duration::from_secs(30));
        assert_eq!(config.scheduling, SchedulingMode::Priority);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_builder() {
        let config = PipelineConfig::new()
            .with_buffer_capacity(8)
            .with_permit_count(2)
            .with_worker_count(3)
            .with_retry(5, Duration::from_millis(10))
            .with_result_timeout(Duration::from_secs(1))
            .with_scheduling(SchedulingMode::Fifo)
            .with_shutdown_timeout(Duration::from_secs(2));

        assert_eq!(config.buffer_capacity, 8);
        assert_eq!(config.permit_count, 2);
        assert_eq!(config.worker_count, 3);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.to_policy().delay(), Duration::from_millis(10));
        assert_eq!(config.scheduling, SchedulingMode::Fifo);
        assert_eq!(config.shutdown_timeout, Duration::from_secs(2));
    }

    #[test]
    fn test_validation_rejects_zero_sizes() {
        for config in [
            PipelineConfig::default().with_buffer_capacity(0),
            PipelineConfig::default().with_permit_count(0),
            PipelineConfig::default().with_worker_count(0),
            PipelineConfig::default().with_retry(0, Duration::ZERO),
            PipelineConfig::default().with_result_timeout(Duration::ZERO),
        ] {
            let err = config.validate().expect_err("invalid config");
            assert!(matches!(err, ConfigError::ValidationFailed(_)));
        }
    }

    #[test]
    fn test_zero_retry_delay_is_valid() {
        let config = PipelineConfig::default().with_retry(1, Duration::ZERO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = PipelineConfig::from_lookup(lookup_from(&[
            ("WORKLINE_BUFFER_CAPACITY", "128"),
            ("WORKLINE_WORKERS", " 8 "),
            ("WORKLINE_RETRY_DELAY_MS", "250"),
            ("WORKLINE_SCHEDULING", "FIFO"),
        ]))
        .expect("valid env");

        assert_eq!(config.buffer_capacity, 128);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.permit_count, 16);
        assert_eq!(config.retry.delay, Duration::from_millis(250));
        assert_eq!(config.scheduling, SchedulingMode::Fifo);
    }

    #[test]
    fn test_env_invalid_value() {
        let err = PipelineConfig::from_lookup(lookup_from(&[("WORKLINE_PERMITS", "many")]))
            .expect_err("not a number");
        assert!(err.to_string().contains("WORKLINE_PERMITS"));

        let err = PipelineConfig::from_lookup(lookup_from(&[("WORKLINE_SCHEDULING", "random")]))
            .expect_err("unknown mode");
        assert!(err.to_string().contains("random"));
    }

    #[test]
    fn test_yaml_partial_file_keeps_defaults() {
        let config = PipelineConfig::from_yaml_str(
            "worker_count: 2\nretry:\n  delay_ms: 5\nresult_timeout_ms: 1500\n",
        )
        .expect("valid yaml");

        assert_eq!(config.worker_count, 2);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.delay, Duration::from_millis(5));
        assert_eq!(config.result_timeout, Duration::from_millis(1500));
        assert_eq!(config.buffer_capacity, 64);
    }

    #[test]
    fn test_yaml_file_then_env_layering() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "permit_count: 4\nworker_count: 2\nscheduling: fifo").expect("write");

        let config = PipelineConfig::from_yaml_file(file.path())
            .expect("readable file")
            .apply_env(lookup_from(&[("WORKLINE_WORKERS", "6")]))
            .expect("valid env");

        assert_eq!(config.permit_count, 4);
        assert_eq!(config.worker_count, 6);
        assert_eq!(config.scheduling, SchedulingMode::Fifo);
    }

    #[test]
    fn test_yaml_roundtrip_uses_millis() {
        let config = PipelineConfig::default().with_result_timeout(Duration::from_millis(750));
        let yaml = config.to_yaml().expect("serializable");

        assert!(yaml.contains("result_timeout_ms: 750"));
        assert!(yaml.contains("delay_ms: 100"));
        assert_eq!(PipelineConfig::from_yaml_str(&yaml).expect("parses"), config);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = PipelineConfig::from_yaml_file("/nonexistent/workline.yaml")
            .expect_err("missing file");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            key: "KEY".to_string(),
            message: "bad value".to_string(),
        };
        assert!(err.to_string().contains("KEY"));
        assert!(err.to_string().contains("bad value"));

        let err = ConfigError::ValidationFailed("test failure".to_string());
        assert!(err.to_string().contains("test failure"));
    }
}
