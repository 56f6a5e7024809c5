//! Logging Infrastructure
//!
//! The runtime emits diagnostics through the `log` facade (page growth,
//! sealing, delegation decisions, allocation failures). This module provides
//! a logger for embedders that do not install their own: plain text or JSON
//! lines on stderr or stdout.
//!
//! Nothing is installed implicitly. Call [`init`] once at startup.
//!
//! # Example
//!
//! ```rust,ignore
//! use thunkgate_runtime::config::RegistryConfig;
//!
//! let config = RegistryConfig::from_env();
//! thunkgate_runtime::log::init(&config.log)?;
//! ```

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::LogConfig;

/// Log level enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum LogLevel {
    /// Trace level (most verbose).
    Trace = 0,
    /// Debug level.
    Debug = 1,
    /// Info level.
    #[default]
    Info = 2,
    /// Warning level.
    Warn = 3,
    /// Error level.
    Error = 4,
    /// Off (no logging).
    Off = 5,
}

impl LogLevel {
    /// Get the level name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Off => "OFF",
        }
    }

    /// Parse a log level from its name, case-insensitively.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "TRACE" => Some(LogLevel::Trace),
            "DEBUG" => Some(LogLevel::Debug),
            "INFO" => Some(LogLevel::Info),
            "WARN" | "WARNING" => Some(LogLevel::Warn),
            "ERROR" | "ERR" => Some(LogLevel::Error),
            "OFF" | "NONE" => Some(LogLevel::Off),
            _ => None,
        }
    }

    /// The matching `log` crate filter.
    pub fn to_level_filter(self) -> ::log::LevelFilter {
        match self {
            LogLevel::Trace => ::log::LevelFilter::Trace,
            LogLevel::Debug => ::log::LevelFilter::Debug,
            LogLevel::Info => ::log::LevelFilter::Info,
            LogLevel::Warn => ::log::LevelFilter::Warn,
            LogLevel::Error => ::log::LevelFilter::Error,
            LogLevel::Off => ::log::LevelFilter::Off,
        }
    }
}

impl From<::log::Level> for LogLevel {
    fn from(level: ::log::Level) -> Self {
        match level {
            ::log::Level::Trace => LogLevel::Trace,
            ::log::Level::Debug => LogLevel::Debug,
            ::log::Level::Info => LogLevel::Info,
            ::log::Level::Warn => LogLevel::Warn,
            ::log::Level::Error => LogLevel::Error,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Plain text format (human readable).
    #[default]
    Plain,
    /// JSON format (machine readable).
    Json,
}

impl LogFormat {
    /// Parse a format from a string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "plain" | "text" => Some(LogFormat::Plain),
            "json" => Some(LogFormat::Json),
            _ => None,
        }
    }
}

/// A formatted log line, before output.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Log level.
    pub level: LogLevel,
    /// Log message.
    pub message: String,
    /// Timestamp (Unix milliseconds), if enabled.
    pub timestamp: Option<u64>,
    /// Thread name (if available).
    pub thread_name: Option<String>,
    /// Module/target name.
    pub target: Option<String>,
}

impl LogEntry {
    /// Create a new log entry stamped with the current time and thread.
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            level,
            message: message.into(),
            timestamp: Some(timestamp),
            thread_name: std::thread::current().name().map(|s| s.to_string()),
            target: None,
        }
    }

    /// Set the target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Drop the timestamp.
    pub fn without_timestamp(mut self) -> Self {
        self.timestamp = None;
        self
    }

    /// Format as plain text.
    pub fn format_plain(&self) -> String {
        let mut output = String::new();

        if let Some(timestamp) = self.timestamp {
            output.push_str(&format!("[{}.{:03}] ", timestamp / 1000, timestamp % 1000));
        }
        output.push_str(&format!("{:<5} ", self.level.as_str()));
        if let Some(target) = &self.target {
            output.push_str(&format!("[{}] ", target));
        }
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!("({}) ", thread));
        }
        output.push_str(&self.message);
        output
    }

    /// Format as JSON.
    pub fn format_json(&self) -> String {
        let mut output = String::from("{");
        if let Some(timestamp) = self.timestamp {
            output.push_str(&format!("\"timestamp\":{},", timestamp));
        }
        output.push_str(&format!("\"level\":\"{}\"", self.level.as_str()));
        if let Some(target) = &self.target {
            output.push_str(&format!(",\"target\":\"{}\"", escape_json(target)));
        }
        if let Some(thread) = &self.thread_name {
            output.push_str(&format!(",\"thread\":\"{}\"", escape_json(thread)));
        }
        output.push_str(&format!(",\"message\":\"{}\"", escape_json(&self.message)));
        output.push('}');
        output
    }

    /// Format according to the given format.
    pub fn format(&self, format: LogFormat) -> String {
        match format {
            LogFormat::Plain => self.format_plain(),
            LogFormat::Json => self.format_json(),
        }
    }
}

/// Escape a string for JSON output.
fn escape_json(s: &str) -> String {
    let mut output = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => output.push_str("\\\""),
            '\\' => output.push_str("\\\\"),
            '\n' => output.push_str("\\n"),
            '\r' => output.push_str("\\r"),
            '\t' => output.push_str("\\t"),
            c if c.is_control() => output.push_str(&format!("\\u{:04x}", c as u32)),
            c => output.push(c),
        }
    }
    output
}

/// Logger writing [`LogEntry`] lines to stderr or stdout.
#[derive(Debug)]
pub struct RuntimeLogger {
    level: LogLevel,
    format: LogFormat,
    use_stderr: bool,
    timestamps: bool,
}

impl RuntimeLogger {
    /// Build a logger from configuration.
    pub fn new(config: &LogConfig) -> Self {
        Self {
            level: config.level,
            format: config.format,
            use_stderr: config.use_stderr,
            timestamps: config.timestamps,
        }
    }

    /// Render a record the way this logger would print it.
    pub fn render(&self, record: &::log::Record<'_>) -> String {
        let mut entry = LogEntry::new(record.level().into(), record.args().to_string())
            .with_target(record.target());
        if !self.timestamps {
            entry = entry.without_timestamp();
        }
        entry.format(self.format)
    }
}

impl ::log::Log for RuntimeLogger {
    fn enabled(&self, metadata: &::log::Metadata<'_>) -> bool {
        LogLevel::from(metadata.level()) >= self.level
    }

    fn log(&self, record: &::log::Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.render(record);
        if self.use_stderr {
            let _ = writeln!(std::io::stderr(), "{}", line);
        } else {
            let _ = writeln!(std::io::stdout(), "{}", line);
        }
    }

    fn flush(&self) {
        if self.use_stderr {
            let _ = std::io::stderr().flush();
        } else {
            let _ = std::io::stdout().flush();
        }
    }
}

static LOGGER: OnceLock<RuntimeLogger> = OnceLock::new();

/// Install the runtime logger as the global `log` logger.
///
/// Fails if any logger (this one or another) was already installed.
pub fn init(config: &LogConfig) -> Result<(), ::log::SetLoggerError> {
    let logger = LOGGER.get_or_init(|| RuntimeLogger::new(config));
    ::log::set_logger(logger)?;
    ::log::set_max_level(logger.level.to_level_filter());
    Ok(())
}
