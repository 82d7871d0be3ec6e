//! Swarm Configuration
//!
//! One YAML document configures every component. Every section and field
//! is optional; anything missing falls back to its default.
//!
//! ```yaml
//! bus:
//!   request_timeout: 10000
//! coordination:
//!   lock_wait_timeout: 5000
//! executor:
//!   failure_policy: best_effort
//! logging:
//!   level: debug
//! ```
//!
//! Durations are written in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::bus::MessageBusConfig;
use crate::coordination::CoordinationConfig;
use crate::telemetry::LoggingConfig;
use crate::workflow::ExecutorConfig;

/// Environment variable naming a config file for [`SwarmConfig::load`]
pub const CONFIG_PATH_ENV: &str = "ASTER_SWARM_CONFIG";

/// Result type alias for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error types for configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The document is not valid YAML for this schema
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A value is out of range
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    pub bus: MessageBusConfig,
    pub coordination: CoordinationConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl SwarmConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        let config: SwarmConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), "loading swarm config");
        Self::from_yaml_str(&contents)
    }

    /// Load from the file named by `ASTER_SWARM_CONFIG`, or defaults when unset
    pub fn load() -> ConfigResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// Render as YAML
    pub fn to_yaml_string(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.bus.validate().map_err(ConfigError::Invalid)?;
        self.coordination.validate().map_err(ConfigError::Invalid)?;
        self.executor.validate().map_err(ConfigError::Invalid)?;
        Ok(())
    }
}

/// Serialize a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// As [`duration_ms`] for `Option<Duration>`
pub mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::FailurePolicy;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = SwarmConfig::default();
        assert_eq!(config.bus.topic, crate::bus::AGENT_MESSAGE_TOPIC);
        assert_eq!(config.bus.request_timeout, Duration::from_secs(30));
        assert_eq!(config.coordination.state_update_retries, 5);
        assert_eq!(config.executor.default_step_timeout, Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let yaml = r#"
bus:
  request_timeout: 1500
executor:
  failure_policy: best_effort
"#;
        let config = SwarmConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.bus.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.bus.dedup_window, Duration::from_secs(300));
        assert_eq!(config.executor.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let yaml = "coordination:\n  state_update_retries: 0\n";
        let err = SwarmConfig::from_yaml_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_malformed_yaml_rejected() {
        let err = SwarmConfig::from_yaml_str("bus: [not, a, map]").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  level: debug").unwrap();

        let config = SwarmConfig::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_missing_file() {
        let err = SwarmConfig::from_file("/definitely/not/here.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_yaml_round_trip_keeps_durations_readable() {
        let yaml = SwarmConfig::default().to_yaml_string().unwrap();
        assert!(yaml.contains("request_timeout: 30000"));
        let parsed = SwarmConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.bus.ack_timeout, Duration::from_secs(2));
    }
}
