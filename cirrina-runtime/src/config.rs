//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via CIRRINA_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Runtime configuration.
    pub runtime: RuntimeConfig,
    /// Event broker configuration.
    pub broker: BrokerConfig,
    /// Coordination configuration.
    pub coordination: CoordinationConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("CIRRINA_CONFIG").ok();
        Self::load_with(path.as_deref().map(Path::new))
    }

    /// Loads configuration from the given file (defaults if None), then
    /// applies environment variable overrides and validates.
    pub fn load_with(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.runtime.apply_env_overrides();
        self.broker.apply_env_overrides();
        self.coordination.apply_env_overrides();
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.runtime.shutdown_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "shutdown_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.broker.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "broker channel_capacity must be greater than zero".to_string(),
            ));
        }
        self.coordination.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Scheduling policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerPolicy {
    /// Cycle through instances, resuming after the last selected one.
    #[default]
    RoundRobin,
}

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Name matched against the runtime name of coordination jobs.
    pub name: String,
    /// Maximum time to wait for in-flight commands on shutdown.
    pub shutdown_timeout_ms: u64,
    /// Scheduling policy.
    pub scheduler: SchedulerPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            name: "runtime".to_string(),
            shutdown_timeout_ms: 5000,
            scheduler: SchedulerPolicy::RoundRobin,
        }
    }
}

impl RuntimeConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("CIRRINA_RUNTIME_NAME") {
            if !name.is_empty() {
                self.name = name;
            }
        }

        if let Ok(timeout) = std::env::var("CIRRINA_SHUTDOWN_TIMEOUT_MS") {
            if let Ok(ms) = timeout.parse() {
                self.shutdown_timeout_ms = ms;
            }
        }

        if let Ok(policy) = std::env::var("CIRRINA_SCHEDULER") {
            self.scheduler = match policy.to_lowercase().as_str() {
                "round_robin" | "roundrobin" => SchedulerPolicy::RoundRobin,
                other => {
                    tracing::warn!("Unknown scheduler '{}', using round_robin", other);
                    SchedulerPolicy::RoundRobin
                }
            };
        }
    }

    /// Returns the shutdown timeout as Duration.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Event broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Capacity of the broker observation channel.
    pub channel_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl BrokerConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("CIRRINA_BROKER_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.channel_capacity = n;
            }
        }
    }
}

/// Coordination configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Enable the job monitor.
    pub enabled: bool,
    /// Parent node of job descriptions.
    pub jobs_path: String,
    /// Parent node of job locks.
    pub locks_path: String,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jobs_path: "/jobs".to_string(),
            locks_path: "/locks".to_string(),
        }
    }
}

impl CoordinationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CIRRINA_COORDINATION") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
    }

    /// Validates coordination paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, path) in [("jobs_path", &self.jobs_path), ("locks_path", &self.locks_path)] {
            if !path.starts_with('/') || path.len() < 2 || path.ends_with('/') {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be an absolute node path, got '{}'",
                    key, path
                )));
            }
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.runtime.name, "runtime");
        assert_eq!(config.runtime.shutdown_timeout(), Duration::from_secs(5));
        assert_eq!(config.runtime.scheduler, SchedulerPolicy::RoundRobin);
        assert_eq!(config.broker.channel_capacity, 1024);
        assert!(!config.coordination.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.runtime.name, config.runtime.name);
        assert_eq!(parsed.coordination.jobs_path, "/jobs");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let parsed: Config = serde_yaml::from_str("runtime:\n  name: edge\n").unwrap();
        assert_eq!(parsed.runtime.name, "edge");
        assert_eq!(parsed.runtime.shutdown_timeout_ms, 5000);
        assert_eq!(parsed.coordination.locks_path, "/locks");
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cirrina.yaml");

        let mut config = Config::default();
        config.runtime.name = "worker-1".to_string();
        config.coordination.enabled = true;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.runtime.name, "worker-1");
        assert!(loaded.coordination.enabled);
    }

    #[test]
    fn test_load_with_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cirrina.yaml");
        std::fs::write(&path, "coordination:\n  jobs_path: relative\n").unwrap();

        let result = Config::load_with(Some(&path));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/cirrina.yaml");
        assert!(matches!(result, Err(ConfigError::IoError(_, _))));
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        config.runtime.shutdown_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coordination.jobs_path = "jobs".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.coordination.locks_path = "/locks/".to_string();
        assert!(config.validate().is_err());
    }
}
