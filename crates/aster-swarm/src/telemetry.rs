//! Logging setup
//!
//! Components log through `tracing`; binaries embedding the swarm call
//! [`init_tracing`] once at startup to get formatted output. `RUST_LOG`
//! takes precedence over the configured level.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

use crate::config::{ConfigError, ConfigResult};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `aster_swarm=debug,warn`
    pub level: String,
    /// Colored output
    pub ansi: bool,
    /// Include the event target (module path)
    pub with_target: bool,
    /// Include thread ids
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            ansi: true,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    /// Build the filter, preferring `RUST_LOG` when set
    pub fn env_filter(&self) -> ConfigResult<EnvFilter> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }
        EnvFilter::try_new(&self.level)
            .map_err(|e| ConfigError::Invalid(format!("logging.level '{}': {}", self.level, e)))
    }
}

/// Install the global fmt subscriber
///
/// Returns `Ok(false)` when a global subscriber was already installed.
pub fn init_tracing(config: &LoggingConfig) -> ConfigResult<bool> {
    let filter = config.env_filter()?;
    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(config.ansi)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids)
        .try_init()
        .is_ok();
    Ok(installed)
}
