//! Logging sink for the GPU resource core
//!
//! Every component receives an `Arc<dyn Logger>` when it is constructed and
//! logs through it. There is no process-wide logger: tests pass a capturing or
//! silent logger, applications pass `DefaultLogger` or `FacadeLogger`.
//!
//! - Severity levels (Trace, Debug, Info, Warn, Error)
//! - Colored console output with `DefaultLogger`
//! - Bridge to the `log` crate with `FacadeLogger`
//! - File and line information for ERROR logs

use colored::*;
use std::sync::Arc;
use std::time::SystemTime;
use chrono::{DateTime, Local};

/// Logger trait for custom logging implementations
///
/// # Example
///
/// ```no_run
/// use gpu_resource_core::gpucore::log::{Logger, LogEntry};
///
/// struct FileLogger {
///     file: std::fs::File,
/// }
///
/// impl Logger for FileLogger {
///     fn log(&self, entry: &LogEntry) {
///         // Write to file...
///     }
/// }
/// ```
pub trait Logger: Send + Sync {
    /// Log an entry
    fn log(&self, entry: &LogEntry);

    /// Whether entries of this severity would be kept
    ///
    /// The logging macros skip message formatting when this returns false.
    fn enabled(&self, _severity: LogSeverity) -> bool {
        true
    }
}

/// Log entry containing all information about a log message
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Severity level (Trace, Debug, Info, Warn, Error)
    pub severity: LogSeverity,

    /// Timestamp when the log was created
    pub timestamp: SystemTime,

    /// Source component (e.g., "gpucore::ObjectPool")
    pub source: String,

    /// Log message
    pub message: String,

    /// Source file (only for ERROR logs)
    pub file: Option<&'static str>,

    /// Source line (only for ERROR logs)
    pub line: Option<u32>,
}

/// Log severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogSeverity {
    /// Very verbose debug information
    Trace,

    /// Development/debugging information
    Debug,

    /// Important informational messages
    Info,

    /// Warning messages (potential issues)
    Warn,

    /// Error messages (critical issues with file:line details)
    Error,
}

impl LogSeverity {
    /// Matching level of the `log` crate
    pub fn to_level(self) -> ::log::Level {
        match self {
            LogSeverity::Trace => ::log::Level::Trace,
            LogSeverity::Debug => ::log::Level::Debug,
            LogSeverity::Info => ::log::Level::Info,
            LogSeverity::Warn => ::log::Level::Warn,
            LogSeverity::Error => ::log::Level::Error,
        }
    }
}

/// Default logger implementation using colored console output
///
/// Format:
/// - Normal: `[timestamp] [SEVERITY] [source] message`
/// - Error: `[timestamp] [ERROR] [source] message (file:line)`
pub struct DefaultLogger;

impl Logger for DefaultLogger {
    fn log(&self, entry: &LogEntry) {
        let datetime: DateTime<Local> = entry.timestamp.into();
        let timestamp = datetime.format("%Y-%m-%d %H:%M:%S%.3f").to_string();

        let severity_str = match entry.severity {
            LogSeverity::Trace => "TRACE".bright_black(),
            LogSeverity::Debug => "DEBUG".cyan(),
            LogSeverity::Info => "INFO ".green(),
            LogSeverity::Warn => "WARN ".yellow(),
            LogSeverity::Error => "ERROR".red().bold(),
        };

        let source = entry.source.bright_blue();

        if let (Some(file), Some(line)) = (entry.file, entry.line) {
            println!(
                "[{}] [{}] [{}] {} ({}:{})",
                timestamp, severity_str, source, entry.message, file, line
            );
        } else {
            println!("[{}] [{}] [{}] {}", timestamp, severity_str, source, entry.message);
        }
    }
}

/// Logger that discards every entry
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _entry: &LogEntry) {}

    fn enabled(&self, _severity: LogSeverity) -> bool {
        false
    }
}

/// Logger forwarding to the `log` crate facade
///
/// The entry source becomes the log target, so `env_logger` style filters
/// such as `gpucore::ObjectPool=debug` apply per component.
pub struct FacadeLogger;

impl Logger for FacadeLogger {
    fn log(&self, entry: &LogEntry) {
        let level = entry.severity.to_level();
        match (entry.file, entry.line) {
            (Some(file), Some(line)) => {
                ::log::log!(target: entry.source.as_str(), level, "{} ({}:{})", entry.message, file, line)
            }
            _ => ::log::log!(target: entry.source.as_str(), level, "{}", entry.message),
        }
    }

    /// Only the global `log::max_level` is checked here. Per-target filters
    /// need the entry source and are applied when `log` dispatches it.
    fn enabled(&self, severity: LogSeverity) -> bool {
        severity.to_level() <= ::log::max_level()
    }
}

/// Shared handle to the silent logger
pub fn null_logger() -> Arc<dyn Logger> {
    Arc::new(NullLogger)
}

/// Build and dispatch an entry (used by the logging macros)
pub fn emit(
    logger: &dyn Logger,
    severity: LogSeverity,
    source: &str,
    message: String,
    location: Option<(&'static str, u32)>,
) {
    logger.log(&LogEntry {
        severity,
        timestamp: SystemTime::now(),
        source: source.to_string(),
        message,
        file: location.map(|(file, _)| file),
        line: location.map(|(_, line)| line),
    });
}

// ===== LOGGING MACROS =====

/// Log a TRACE message
///
/// ```ignore
/// gpu_trace!(self.logger, "gpucore::IndexAllocator", "allocate({})", count);
/// ```
#[macro_export]
macro_rules! gpu_trace {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let logger: &dyn $crate::log::Logger = &*$logger;
        if logger.enabled($crate::log::LogSeverity::Trace) {
            $crate::log::emit(logger, $crate::log::LogSeverity::Trace, $source, format!($($arg)*), None)
        }
    }};
}

/// Log a DEBUG message
#[macro_export]
macro_rules! gpu_debug {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let logger: &dyn $crate::log::Logger = &*$logger;
        if logger.enabled($crate::log::LogSeverity::Debug) {
            $crate::log::emit(logger, $crate::log::LogSeverity::Debug, $source, format!($($arg)*), None)
        }
    }};
}

/// Log an INFO message
#[macro_export]
macro_rules! gpu_info {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let logger: &dyn $crate::log::Logger = &*$logger;
        if logger.enabled($crate::log::LogSeverity::Info) {
            $crate::log::emit(logger, $crate::log::LogSeverity::Info, $source, format!($($arg)*), None)
        }
    }};
}

/// Log a WARN message
#[macro_export]
macro_rules! gpu_warn {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let logger: &dyn $crate::log::Logger = &*$logger;
        if logger.enabled($crate::log::LogSeverity::Warn) {
            $crate::log::emit(logger, $crate::log::LogSeverity::Warn, $source, format!($($arg)*), None)
        }
    }};
}

/// Log an ERROR message with file:line information
#[macro_export]
macro_rules! gpu_error {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let logger: &dyn $crate::log::Logger = &*$logger;
        if logger.enabled($crate::log::LogSeverity::Error) {
            $crate::log::emit(
                logger,
                $crate::log::LogSeverity::Error,
                $source,
                format!($($arg)*),
                Some((file!(), line!())),
            )
        }
    }};
}

/// Log an ERROR and build an `Error::BackendError` with the same message
///
/// ```ignore
/// .map_err(|e| gpu_err!(self.logger, "gpucore::ObjectPool", "create failed: {}", e))?;
/// ```
#[macro_export]
macro_rules! gpu_err {
    ($logger:expr, $source:expr, $($arg:tt)*) => {{
        let message = format!($($arg)*);
        $crate::gpu_error!($logger, $source, "{}", message);
        $crate::error::Error::BackendError(message)
    }};
}

/// Log an ERROR and return `Err(Error::BackendError)` from the enclosing function
#[macro_export]
macro_rules! gpu_bail {
    ($logger:expr, $source:expr, $($arg:tt)*) => {
        return Err($crate::gpu_err!($logger, $source, $($arg)*))
    };
}

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;
