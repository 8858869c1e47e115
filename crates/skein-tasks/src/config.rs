//! Task runner configuration
//!
//! Configuration can be built in code, parsed from a TOML string, or loaded
//! from a file:
//!
//! ```toml
//! worker_count = 4
//! queue_capacity = 128
//! handle_capacity = 32
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Default number of worker threads
pub const DEFAULT_WORKER_COUNT: usize = 1;

/// Default number of queued tasks
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Default number of live thread and mutex handles
pub const DEFAULT_HANDLE_CAPACITY: usize = 64;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read task config: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse task config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Failed to serialize TOML
    #[error("Failed to serialize task config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A field failed validation
    #[error("Invalid task config: {0}")]
    Invalid(#[from] skein_object::Error),
}

/// Task runner configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TasksConfig {
    /// Number of worker threads draining the queue
    pub worker_count: usize,

    /// Maximum number of queued tasks
    pub queue_capacity: usize,

    /// Maximum number of live thread and mutex handles
    pub handle_capacity: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            handle_capacity: DEFAULT_HANDLE_CAPACITY,
        }
    }
}

impl TasksConfig {
    /// Default configuration with one worker per logical CPU
    pub fn with_available_parallelism() -> Self {
        Self {
            worker_count: num_cpus::get().max(1),
            ..Self::default()
        }
    }

    /// Check that every field is non-zero
    pub fn validate(&self) -> skein_object::Result<()> {
        if self.worker_count == 0 {
            return Err(skein_object::Error::InvalidArgument("worker_count must be non-zero"));
        }
        if self.queue_capacity == 0 {
            return Err(skein_object::Error::InvalidArgument("queue_capacity must be non-zero"));
        }
        if self.handle_capacity == 0 {
            return Err(skein_object::Error::InvalidArgument("handle_capacity must be non-zero"));
        }
        Ok(())
    }

    /// Parse and validate a TOML configuration
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: TasksConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Render the configuration as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}
