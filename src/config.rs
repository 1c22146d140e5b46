//! Configuration for reactor construction.
//!
//! Loops are always constructed explicitly from a [`LoopConfig`] and injected
//! into every handle constructor; there is no process-wide default loop, so
//! tests and embedders can run isolated reactors side by side.

use crate::error::{Result, TidewayError};
use crate::logging::LogLevel;

/// Complete configuration for one reactor instance.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Readiness polling configuration
    pub poll: PollConfig,
    /// Transfer buffer configuration
    pub buffer: BufferConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Readiness polling options.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Maximum readiness events drained per poll
    pub max_events: usize,
    /// Attempt one synchronous write when a write reaches the head of an
    /// idle queue, instead of waiting for a writability event
    pub immediate_write: bool,
}

/// Transfer buffer options.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Size of each pooled lease in bytes; also the read chunk size
    pub lease_size: usize,
    /// Number of leases kept pooled; exhaustion falls back to the heap
    pub pool_capacity: usize,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Enable the global logger during reactor construction
    pub enabled: bool,
    /// Minimum level when enabled
    pub level: LogLevel,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            poll: PollConfig::default(),
            buffer: BufferConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_events: 64,
            immediate_write: true,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            lease_size: 4096,
            pool_capacity: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
        }
    }
}

impl LoopConfig {
    /// Configuration tuned for small-message latency.
    ///
    /// Small read chunks and a shallow event batch keep per-iteration work
    /// minimal; writes still go out synchronously when the socket allows.
    pub fn low_latency() -> Self {
        Self {
            poll: PollConfig {
                max_events: 16,
                immediate_write: true,
            },
            buffer: BufferConfig {
                lease_size: 1024,
                pool_capacity: 32,
            },
            logging: LoggingConfig {
                enabled: false,
                level: LogLevel::Error,
            },
        }
    }

    /// Configuration for development and debugging.
    ///
    /// Disables the synchronous write fast path so every write travels the
    /// full queue-and-complete machinery, and turns on debug logging.
    pub fn development() -> Self {
        Self {
            poll: PollConfig {
                max_events: 64,
                immediate_write: false,
            },
            buffer: BufferConfig {
                lease_size: 4096,
                pool_capacity: 32,
            },
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
            },
        }
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.poll.max_events == 0 {
            return Err(TidewayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "max_events must be greater than 0",
            )));
        }

        if self.buffer.lease_size == 0 {
            return Err(TidewayError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "lease_size must be greater than 0",
            )));
        }

        Ok(())
    }
}

/// Builder for fluent configuration creation.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: LoopConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set polling configuration.
    pub fn poll(mut self, poll: PollConfig) -> Self {
        self.config.poll = poll;
        self
    }

    /// Set buffer configuration.
    pub fn buffer(mut self, buffer: BufferConfig) -> Self {
        self.config.buffer = buffer;
        self
    }

    /// Set logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Build the final configuration.
    pub fn build(self) -> Result<LoopConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
