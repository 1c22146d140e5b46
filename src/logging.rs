//! Structured logging for reactor diagnostics.
//!
//! The reactor, handle lifecycle, and request table all log through this
//! module. Output is disabled until [`init_logger`] runs (normally via
//! [`LoopConfig`](crate::config::LoopConfig) when logging is enabled), so the
//! hot path costs one atomic load when nothing is listening.

use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// Log level for reactor diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose: every submission and completion)
    Trace = 0,
    /// Debug-level logging (lifecycle transitions)
    Debug = 1,
    /// Info-level logging
    Info = 2,
    /// Warning-level logging
    Warn = 3,
    /// Error-level logging
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Timestamp when the log entry was created
    pub timestamp: SystemTime,
    /// Log level
    pub level: LogLevel,
    /// Component that generated the log
    pub component: String,
    /// Request token if applicable
    pub token: Option<u64>,
    /// File descriptor if applicable
    pub fd: Option<i32>,
    /// Message content
    pub message: String,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, component: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            component: component.to_string(),
            token: None,
            fd: None,
            message: message.to_string(),
        }
    }

    /// Add a request token to the log entry.
    pub fn with_token(mut self, token: u64) -> Self {
        self.token = Some(token);
        self
    }

    /// Add a file descriptor to the log entry.
    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Format the log entry as a human-readable line.
    pub fn format(&self) -> String {
        let timestamp = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut parts = vec![
            format!("[{}]", timestamp),
            format!("{}", self.level),
            self.component.clone(),
        ];

        if let Some(token) = self.token {
            parts.push(format!("req:{}", token));
        }

        if let Some(fd) = self.fd {
            parts.push(format!("fd:{}", fd));
        }

        parts.push(self.message.clone());
        parts.join(" ")
    }
}

/// Trait for log output destinations.
pub trait LogOutput: Send + Sync {
    /// Write a log entry to the output.
    fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> Result<()>;
}

/// Console log output that writes to stderr.
#[derive(Debug, Default)]
pub struct ConsoleOutput;

impl ConsoleOutput {
    /// Create a new console output.
    pub fn new() -> Self {
        Self
    }
}

impl LogOutput for ConsoleOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        eprintln!("{}", entry.format());
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        use std::io::Write;
        std::io::stderr().flush()?;
        Ok(())
    }
}

/// Central logger with a minimum level and pluggable outputs.
pub struct Logger {
    /// Minimum log level to output
    min_level: LogLevel,
    /// Output destinations
    outputs: Vec<Box<dyn LogOutput>>,
}

impl Logger {
    /// Create a new logger with console output.
    pub fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
            outputs: vec![Box::new(ConsoleOutput::new())],
        }
    }

    /// Set the minimum log level.
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Add an output destination.
    pub fn add_output(&mut self, output: Box<dyn LogOutput>) {
        self.outputs.push(output);
    }

    /// Log a message at the specified level.
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if level >= self.min_level {
            self.write_entry(&LogEntry::new(level, component, message));
        }
    }

    /// Log a message with request context.
    pub fn log_request(
        &self,
        level: LogLevel,
        component: &str,
        token: u64,
        fd: Option<i32>,
        message: &str,
    ) {
        if level >= self.min_level {
            let mut entry = LogEntry::new(level, component, message).with_token(token);
            if let Some(fd) = fd {
                entry = entry.with_fd(fd);
            }
            self.write_entry(&entry);
        }
    }

    /// Write a log entry to all outputs.
    fn write_entry(&self, entry: &LogEntry) {
        for output in &self.outputs {
            if let Err(e) = output.write(entry) {
                eprintln!("Failed to write log entry: {}", e);
            }
        }
    }

    /// Flush all outputs.
    pub fn flush(&self) {
        for output in &self.outputs {
            if let Err(e) = output.flush() {
                eprintln!("Failed to flush log output: {}", e);
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

/// Global logger instance.
static GLOBAL_LOGGER: std::sync::OnceLock<Arc<Mutex<Logger>>> = std::sync::OnceLock::new();

/// Initialize the global logger, returning the shared instance.
pub fn init_logger() -> Arc<Mutex<Logger>> {
    GLOBAL_LOGGER
        .get_or_init(|| Arc::new(Mutex::new(Logger::new())))
        .clone()
}

/// Log a message using the global logger, if initialized.
pub fn log(level: LogLevel, component: &str, message: &str) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            logger.log(level, component, message);
        }
    }
}

/// Log a request-scoped message using the global logger, if initialized.
pub fn log_request(level: LogLevel, component: &str, token: u64, fd: Option<i32>, message: &str) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            logger.log_request(level, component, token, fd, message);
        }
    }
}

/// Log a trace-level message using the global logger.
#[macro_export]
macro_rules! log_trace {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Trace, $component, &format!($($arg)*))
    };
}

/// Log a debug-level message using the global logger.
#[macro_export]
macro_rules! log_debug {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Debug, $component, &format!($($arg)*))
    };
}

/// Log a warning-level message using the global logger.
#[macro_export]
macro_rules! log_warn {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Warn, $component, &format!($($arg)*))
    };
}

/// Log an error-level message using the global logger.
#[macro_export]
macro_rules! log_error {
    ($component:expr, $($arg:tt)*) => {
        $crate::logging::log($crate::logging::LogLevel::Error, $component, &format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_entry_creation() {
        let entry = LogEntry::new(LogLevel::Info, "reactor", "iteration done")
            .with_token(123)
            .with_fd(4);

        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, "reactor");
        assert_eq!(entry.message, "iteration done");
        assert_eq!(entry.token, Some(123));
        assert_eq!(entry.fd, Some(4));
    }

    #[test]
    fn test_log_entry_formatting() {
        let entry = LogEntry::new(LogLevel::Warn, "pool", "lease fallback").with_fd(7);
        let formatted = entry.format();

        assert!(formatted.contains("WARN"));
        assert!(formatted.contains("pool"));
        assert!(formatted.contains("fd:7"));
        assert!(formatted.contains("lease fallback"));
    }

    #[test]
    fn test_logger_level_filter() {
        let mut logger = Logger::new();
        logger.set_level(LogLevel::Error);
        assert_eq!(logger.min_level, LogLevel::Error);
        assert_eq!(logger.outputs.len(), 1);
    }

    #[test]
    fn test_global_logger() {
        let _logger = init_logger();

        log(LogLevel::Info, "test", "test message");
        log_request(LogLevel::Debug, "test", 123, Some(4), "request message");
    }
}
