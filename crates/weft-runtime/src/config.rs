//! Scheduler configuration
//!
//! Compile-time defaults with runtime environment overrides.
//!
//! # Example
//!
//! ```rust,ignore
//! use weft_runtime::SchedulerConfig;
//!
//! // Defaults with env overrides
//! let config = SchedulerConfig::from_env();
//!
//! // Or customize programmatically
//! let config = SchedulerConfig::from_env().workers(4).use_caller(false);
//! ```

use weft_core::constants::DEFAULT_STACK_SIZE;
use weft_core::env::{env_get, env_get_bool};

/// Scheduler configuration with builder pattern
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of workers, including the caller thread when `use_caller`
    pub workers: usize,
    /// Whether the calling thread participates as the last worker
    pub use_caller: bool,
    /// Scheduler name (worker threads are named "<name>-<id>")
    pub name: String,
    /// Stack size for fibers the scheduler creates
    pub stack_size: usize,
    /// Enable debug logging for worker lifecycle
    pub debug_logging: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl SchedulerConfig {
    /// Create config from defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `WEFT_WORKERS` - Number of workers
    /// - `WEFT_USE_CALLER` - Caller thread participates (0/1)
    /// - `WEFT_STACK_SIZE` - Fiber stack size in bytes
    /// - `WEFT_DEBUG` - Enable debug logging (0/1)
    pub fn from_env() -> Self {
        Self {
            workers: env_get("WEFT_WORKERS", 4),
            use_caller: env_get_bool("WEFT_USE_CALLER", true),
            name: "weft".to_string(),
            stack_size: env_get("WEFT_STACK_SIZE", DEFAULT_STACK_SIZE),
            debug_logging: env_get_bool("WEFT_DEBUG", false),
        }
    }

    // Builder methods

    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn use_caller(mut self, v: bool) -> Self {
        self.use_caller = v;
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.stack_size = size;
        self
    }

    pub fn debug_logging(mut self, v: bool) -> Self {
        self.debug_logging = v;
        self
    }

    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::InvalidValue("workers must be > 0"));
        }
        if self.workers > 256 {
            return Err(ConfigError::InvalidValue("workers must be <= 256"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(ConfigError::InvalidValue("stack_size must be >= 16KB"));
        }
        Ok(())
    }
}

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
