//! Dispatcher configuration
//!
//! Settings can be built in code or loaded from TOML:
//!
//! ```toml
//! name = "render"
//! pool_capacity = 128
//! slow_dispatch_threshold_ms = 16
//! ```

use crate::error::{ConfigError, DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings applied when a dispatcher is prepared
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatcherConfig {
    /// Label used in log events (None = "unnamed")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Capacity of a private task pool (None = share the process-wide pool)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool_capacity: Option<usize>,

    /// Log a warning when one dispatch runs longer than this (None = never)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slow_dispatch_threshold_ms: Option<u64>,
}

impl DispatcherConfig {
    /// Configuration with a log label
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Parse and validate a configuration file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: DispatcherConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Check the settings for values a dispatcher cannot use
    pub fn validate(&self) -> DispatchResult<()> {
        if self.pool_capacity == Some(0) {
            return Err(DispatchError::Config(
                "pool_capacity must be at least 1".to_string(),
            ));
        }
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(DispatchError::Config("name cannot be empty".to_string()));
            }
        }
        Ok(())
    }

    /// Slow-dispatch threshold as a duration
    pub fn slow_dispatch_threshold(&self) -> Option<Duration> {
        self.slow_dispatch_threshold_ms.map(Duration::from_millis)
    }
}
