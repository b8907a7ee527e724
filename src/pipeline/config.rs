//! Orchestrator configuration.
//!
//! Where runs are stored, where pipeline kinds are declared, and how long to
//! wait for gated dependencies. Values come from defaults, environment
//! variables, and builder overrides (the CLI applies its flags last).

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration for the pipeline orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorConfig {
    /// Root directory holding one sub-directory per run.
    pub output_dir: PathBuf,
    /// YAML file declaring pipeline kinds.
    pub manifest_path: PathBuf,
    /// How long a gated step waits for its dependency.
    pub dependency_timeout: Duration,
    /// Delay between health checks while waiting.
    pub poll_interval: Duration,
    /// Timeout for a single health request.
    pub health_request_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./pipeline_runs"),
            manifest_path: PathBuf::from("pipelines.yaml"),
            dependency_timeout: Duration::from_secs(120),
            poll_interval: Duration::from_secs(2),
            health_request_timeout: Duration::from_secs(5),
        }
    }
}

impl OrchestratorConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PIPELINE_OUTPUT_DIR`: Run storage root (default: ./pipeline_runs)
    /// - `PIPELINE_MANIFEST`: Pipeline manifest path (default: pipelines.yaml)
    /// - `PIPELINE_DEPENDENCY_TIMEOUT_SECS`: Dependency wait in seconds (default: 120)
    /// - `PIPELINE_POLL_INTERVAL_MS`: Health poll interval in milliseconds (default: 2000)
    /// - `PIPELINE_HEALTH_TIMEOUT_SECS`: Single health request timeout (default: 5)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("PIPELINE_OUTPUT_DIR") {
            config.output_dir = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PIPELINE_MANIFEST") {
            config.manifest_path = PathBuf::from(val);
        }

        if let Ok(val) = std::env::var("PIPELINE_DEPENDENCY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_DEPENDENCY_TIMEOUT_SECS")?;
            config.dependency_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("PIPELINE_POLL_INTERVAL_MS") {
            let millis: u64 = parse_env_value(&val, "PIPELINE_POLL_INTERVAL_MS")?;
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Ok(val) = std::env::var("PIPELINE_HEALTH_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "PIPELINE_HEALTH_TIMEOUT_SECS")?;
            config.health_request_timeout = Duration::from_secs(secs);
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
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "output_dir cannot be empty".to_string(),
            ));
        }

        if self.dependency_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "dependency_timeout must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.health_request_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "health_request_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder method to set the run storage root.
    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Builder method to set the manifest path.
    pub fn with_manifest_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.manifest_path = path.into();
        self
    }

    /// Builder method to set the dependency wait.
    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = timeout;
        self
    }

    /// Builder method to set the health poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Builder method to set the single health request timeout.
    pub fn with_health_request_timeout(mut self, timeout: Duration) -> Self {
        self.health_request_timeout = timeout;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}
