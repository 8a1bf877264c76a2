//! Runtime configuration
//!
//! Compile-time defaults with environment overrides.
//!
//! # Environment Variables
//!
//! - `WEFT_STACK_SIZE` - fiber stack size in bytes
//! - `WEFT_POLL_BATCH` - max descriptors drained per poll
//! - `WEFT_MAX_POLL_TIMEOUT_MS` - poll timeout ceiling
//! - `WEFT_CONNECT_TIMEOUT_MS` - default connect timeout

use std::sync::OnceLock;

use weft_core::env::env_get;
use weft_core::error::{RuntimeError, RuntimeResult};

/// Default fiber stack size (128 KiB)
pub const STACK_SIZE: usize = 128 * 1024;

/// Default epoll batch size
pub const POLL_BATCH: usize = 256;

/// Default ceiling on the epoll wait, so a worker never sleeps
/// unboundedly even with no timers armed
pub const MAX_POLL_TIMEOUT_MS: u64 = 3000;

/// Default connect timeout
pub const CONNECT_TIMEOUT_MS: u64 = 5000;

/// Runtime tunables with builder-style setters
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Stack bytes per fiber (excluding the guard page)
    pub stack_size: usize,
    /// Max ready descriptors handled per poll round
    pub poll_batch: usize,
    /// Ceiling on a single poll wait in milliseconds
    pub max_poll_timeout_ms: u64,
    /// Default timeout applied by the plain connect wrapper
    pub connect_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl RuntimeConfig {
    /// Compile-time defaults, no environment consulted
    pub fn new() -> Self {
        Self {
            stack_size: STACK_SIZE,
            poll_batch: POLL_BATCH,
            max_poll_timeout_ms: MAX_POLL_TIMEOUT_MS,
            connect_timeout_ms: CONNECT_TIMEOUT_MS,
        }
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        Self {
            stack_size: env_get("WEFT_STACK_SIZE", STACK_SIZE),
            poll_batch: env_get("WEFT_POLL_BATCH", POLL_BATCH),
            max_poll_timeout_ms: env_get("WEFT_MAX_POLL_TIMEOUT_MS", MAX_POLL_TIMEOUT_MS),
            connect_timeout_ms: env_get("WEFT_CONNECT_TIMEOUT_MS", CONNECT_TIMEOUT_MS),
        }
    }

    pub fn stack_size(mut self, n: usize) -> Self {
        self.stack_size = n;
        self
    }

    pub fn poll_batch(mut self, n: usize) -> Self {
        self.poll_batch = n;
        self
    }

    pub fn max_poll_timeout_ms(mut self, ms: u64) -> Self {
        self.max_poll_timeout_ms = ms;
        self
    }

    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.connect_timeout_ms = ms;
        self
    }

    pub fn validate(&self) -> RuntimeResult<()> {
        if self.stack_size < 16 * 1024 {
            return Err(RuntimeError::InvalidConfig("stack_size must be >= 16KB"));
        }
        if self.poll_batch == 0 {
            return Err(RuntimeError::InvalidConfig("poll_batch must be > 0"));
        }
        if self.max_poll_timeout_ms == 0 {
            return Err(RuntimeError::InvalidConfig(
                "max_poll_timeout_ms must be > 0",
            ));
        }
        Ok(())
    }
}

static CONFIG: OnceLock<RuntimeConfig> = OnceLock::new();

/// Process-wide configuration, initialised from the environment on first use
pub fn runtime_config() -> &'static RuntimeConfig {
    CONFIG.get_or_init(RuntimeConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RuntimeConfig::new().validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let cfg = RuntimeConfig::new()
            .stack_size(256 * 1024)
            .connect_timeout_ms(100);
        assert_eq!(cfg.stack_size, 256 * 1024);
        assert_eq!(cfg.connect_timeout_ms, 100);
    }

    #[test]
    fn test_validation_rejects_tiny_stack() {
        let cfg = RuntimeConfig::new().stack_size(1024);
        assert!(cfg.validate().is_err());
    }
}
