//! Queue runtime configuration.

use crate::error::ConfigurationError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Prefix for environment variable overrides, e.g. `KVMQ__NAMESPACE=jobs`
pub const ENV_PREFIX: &str = "KVMQ";

/// Configuration shared by the registry, the engine and the reclaimer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Prefix of every key written to the store
    pub namespace: String,

    /// Capacity ceiling recorded on queues created without an explicit one
    pub default_max_messages: u64,

    /// Optimistic attempts per operation before giving up with a conflict
    pub max_conflict_retries: u32,

    /// Number of pending ids inspected per receive pass
    pub receive_scan_window: usize,

    /// Sweep expired locks before every receive
    pub reclaim_on_receive: bool,

    /// Period of the background reclaimer in milliseconds
    pub reclaim_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            namespace: "rsmq".to_string(),
            default_max_messages: 10_000,
            max_conflict_retries: 16,
            receive_scan_window: 128,
            reclaim_on_receive: true,
            reclaim_interval_ms: 1_000,
        }
    }
}

impl QueueConfig {
    /// Configuration with a custom namespace and defaults elsewhere
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Load configuration from an optional file and the environment
    ///
    /// Later sources override earlier ones: built-in defaults, then the file,
    /// then `KVMQ__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigurationError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

        let config: QueueConfig =
            settings
                .try_deserialize()
                .map_err(|e| ConfigurationError::Parsing {
                    message: e.to_string(),
                })?;

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration for values the runtime cannot work with
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.namespace.is_empty() {
            return Err(ConfigurationError::Missing {
                key: "namespace".to_string(),
            });
        }

        if self.namespace.contains(':') {
            return Err(ConfigurationError::Invalid {
                message: "namespace must not contain ':'".to_string(),
            });
        }

        if self.default_max_messages == 0 {
            return Err(ConfigurationError::Invalid {
                message: "default_max_messages must be at least 1".to_string(),
            });
        }

        if self.max_conflict_retries == 0 {
            return Err(ConfigurationError::Invalid {
                message: "max_conflict_retries must be at least 1".to_string(),
            });
        }

        if self.receive_scan_window == 0 {
            return Err(ConfigurationError::Invalid {
                message: "receive_scan_window must be at least 1".to_string(),
            });
        }

        if self.reclaim_interval_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "reclaim_interval_ms must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_millis(self.reclaim_interval_ms)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
