//! Registry Configuration
//!
//! Configuration for handle registries and the process-wide C-export facade.
//! Configuration can be set programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `THUNKGATE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `THUNKGATE_DELEGATION` | Forward operations to a previously-loaded implementation ("true"/"false") | true |
//! | `THUNKGATE_PREALLOCATE_PAGES` | Trampoline pages mapped per variant at construction | 0 |
//! | `THUNKGATE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//! | `THUNKGATE_LOG_FORMAT` | Log format (plain/json) | plain |
//!
//! # Example
//!
//! ```rust,ignore
//! use thunkgate_runtime::config::RegistryConfig;
//!
//! // Load from environment with defaults
//! let config = RegistryConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = RegistryConfig::builder()
//!     .delegation_enabled(false)
//!     .preallocate_pages(4)
//!     .build()?;
//! ```

use std::env;

pub use crate::log::{LogFormat, LogLevel};

/// Upper bound on pages mapped up front, per variant.
pub const MAX_PREALLOCATE_PAGES: usize = 4096;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,

    /// Write to stderr rather than stdout.
    /// Default: true.
    pub use_stderr: bool,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Plain,
            use_stderr: true,
            timestamps: true,
        }
    }
}

/// Complete registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Initial value of the delegation toggle.
    /// Default: true.
    pub delegation_enabled: bool,

    /// Trampoline pages to map per variant when the registry is built.
    /// Default: 0 (map lazily).
    pub preallocate_pages: usize,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            delegation_enabled: true,
            preallocate_pages: 0,
            log: LogConfig::default(),
        }
    }
}

impl RegistryConfig {
    /// Create a new builder for RegistryConfig.
    pub fn builder() -> RegistryConfigBuilder {
        RegistryConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or fail to parse keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_bool("THUNKGATE_DELEGATION") {
            config.delegation_enabled = val;
        }

        if let Some(val) = parse_env_usize("THUNKGATE_PREALLOCATE_PAGES") {
            config.preallocate_pages = val.min(MAX_PREALLOCATE_PAGES);
        }

        if let Ok(val) = env::var("THUNKGATE_LOG_LEVEL") {
            if let Some(level) = LogLevel::parse(&val) {
                config.log.level = level;
            }
        }

        if let Ok(val) = env::var("THUNKGATE_LOG_FORMAT") {
            if let Some(format) = LogFormat::parse(&val) {
                config.log.format = format;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.preallocate_pages > MAX_PREALLOCATE_PAGES {
            return Err(ConfigError::InvalidValue {
                field: "preallocate_pages".into(),
                message: format!("must be at most {}", MAX_PREALLOCATE_PAGES),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// Invalid configuration value.
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue { field, message } => {
                write!(f, "invalid configuration for '{}': {}", field, message)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builder for RegistryConfig.
#[derive(Debug, Clone, Default)]
pub struct RegistryConfigBuilder {
    config: RegistryConfig,
}

impl RegistryConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the initial delegation toggle.
    pub fn delegation_enabled(mut self, enabled: bool) -> Self {
        self.config.delegation_enabled = enabled;
        self
    }

    /// Set the number of pages mapped per variant up front.
    pub fn preallocate_pages(mut self, pages: usize) -> Self {
        self.config.preallocate_pages = pages;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log.format = format;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RegistryConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RegistryConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}
