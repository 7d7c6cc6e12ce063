//! Lifetime Configuration
//!
//! Process-wide settings for logging, fail-fast behavior and diagnostics.
//! Configuration can be set programmatically or loaded from environment
//! variables, then applied with [`crate::init`].
//!
//! # Environment Variables
//!
//! All environment variables use the `LIFELINE_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `LIFELINE_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | warn |
//! | `LIFELINE_LOG_FORMAT` | Log format (plain/json) | plain |
//! | `LIFELINE_LOG_STDERR` | Log to stderr instead of stdout ("true"/"false") | true |
//! | `LIFELINE_FAIL_FAST` | Fail-fast mode (abort/panic) | abort |
//! | `LIFELINE_CAPTURE_BACKTRACE` | Capture a backtrace on fail-fast | true in debug builds |
//! | `LIFELINE_TRACK_STATS` | Count lifetime events | true in debug builds |
//! | `LIFELINE_POISON_FREED` | Overwrite freed blocks with `0xDD` | false |
//!
//! # Example
//!
//! ```rust,ignore
//! use lifeline::config::LifetimeConfig;
//! use lifeline::fail_fast::FailFastMode;
//!
//! // Load from environment with defaults
//! let config = LifetimeConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = LifetimeConfig::builder()
//!     .fail_fast_mode(FailFastMode::Panic)
//!     .poison_freed(true)
//!     .build()?;
//! lifeline::init(config);
//! ```

use std::env;

use thiserror::Error;

use crate::fail_fast::FailFastMode;
use crate::log::{LogFormat, LogLevel};

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum level emitted.
    /// Default: Warn.
    pub level: LogLevel,

    /// Output format.
    /// Default: Plain.
    pub format: LogFormat,

    /// Write to stderr rather than stdout.
    /// Default: true.
    pub use_stderr: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            format: LogFormat::Plain,
            use_stderr: true,
        }
    }
}

/// Fail-fast configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailFastConfig {
    /// What happens after hooks run.
    /// Default: Abort.
    pub mode: FailFastMode,

    /// Capture a backtrace into the failure record.
    /// Default: true in debug builds.
    pub capture_backtrace: bool,
}

impl Default for FailFastConfig {
    fn default() -> Self {
        Self {
            mode: FailFastMode::Abort,
            capture_backtrace: cfg!(debug_assertions),
        }
    }
}

/// Diagnostics configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticsConfig {
    /// Count lifetime events in [`crate::stats`].
    /// Default: true in debug builds.
    pub track_stats: bool,

    /// Overwrite freed object blocks and proxies with
    /// [`POISON_BYTE`](crate::stats::POISON_BYTE).
    /// Default: false.
    pub poison_freed: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            track_stats: cfg!(debug_assertions),
            poison_freed: false,
        }
    }
}

/// Complete configuration.
///
/// Use `LifetimeConfig::default()` for sensible defaults, or
/// `LifetimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifetimeConfig {
    /// Logging configuration.
    pub log: LogConfig,

    /// Fail-fast configuration.
    pub fail_fast: FailFastConfig,

    /// Diagnostics configuration.
    pub diagnostics: DiagnosticsConfig,
}

impl LifetimeConfig {
    /// Create a new builder for LifetimeConfig.
    pub fn builder() -> LifetimeConfigBuilder {
        LifetimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are not set or do not parse keep their default values.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration from environment variables, rejecting values that
    /// do not parse and configurations that do not validate.
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::try_from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(level) = lookup(ENV_LOG_LEVEL).and_then(|v| LogLevel::from_str(&v)) {
            config.log.level = level;
        }
        if let Some(format) = lookup(ENV_LOG_FORMAT).and_then(|v| LogFormat::from_str(&v)) {
            config.log.format = format;
        }
        if let Some(val) = lookup(ENV_LOG_STDERR).and_then(|v| parse_bool(&v)) {
            config.log.use_stderr = val;
        }

        if let Some(mode) = lookup(ENV_FAIL_FAST).and_then(|v| FailFastMode::from_str(&v)) {
            config.fail_fast.mode = mode;
        }
        if let Some(val) = lookup(ENV_CAPTURE_BACKTRACE).and_then(|v| parse_bool(&v)) {
            config.fail_fast.capture_backtrace = val;
        }

        if let Some(val) = lookup(ENV_TRACK_STATS).and_then(|v| parse_bool(&v)) {
            config.diagnostics.track_stats = val;
        }
        if let Some(val) = lookup(ENV_POISON_FREED).and_then(|v| parse_bool(&v)) {
            config.diagnostics.poison_freed = val;
        }

        config
    }

    fn try_from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup(ENV_LOG_LEVEL) {
            config.log.level = LogLevel::from_str(&v)
                .ok_or_else(|| ConfigError::env(ENV_LOG_LEVEL, &v, "off/error/warn/info/debug/trace"))?;
        }
        if let Some(v) = lookup(ENV_LOG_FORMAT) {
            config.log.format =
                LogFormat::from_str(&v).ok_or_else(|| ConfigError::env(ENV_LOG_FORMAT, &v, "plain/json"))?;
        }
        if let Some(v) = lookup(ENV_LOG_STDERR) {
            config.log.use_stderr = require_bool(ENV_LOG_STDERR, &v)?;
        }

        if let Some(v) = lookup(ENV_FAIL_FAST) {
            config.fail_fast.mode =
                FailFastMode::from_str(&v).ok_or_else(|| ConfigError::env(ENV_FAIL_FAST, &v, "abort/panic"))?;
        }
        if let Some(v) = lookup(ENV_CAPTURE_BACKTRACE) {
            config.fail_fast.capture_backtrace = require_bool(ENV_CAPTURE_BACKTRACE, &v)?;
        }

        if let Some(v) = lookup(ENV_TRACK_STATS) {
            config.diagnostics.track_stats = require_bool(ENV_TRACK_STATS, &v)?;
        }
        if let Some(v) = lookup(ENV_POISON_FREED) {
            config.diagnostics.poison_freed = require_bool(ENV_POISON_FREED, &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Panic mode relies on unwinding to deliver the failure record.
        if self.fail_fast.mode == FailFastMode::Panic && !cfg!(panic = "unwind") {
            return Err(ConfigError::InvalidValue {
                field: "fail_fast.mode".into(),
                message: "panic mode requires unwinding panic strategy".into(),
            });
        }

        Ok(())
    }
}

const ENV_LOG_LEVEL: &str = "LIFELINE_LOG_LEVEL";
const ENV_LOG_FORMAT: &str = "LIFELINE_LOG_FORMAT";
const ENV_LOG_STDERR: &str = "LIFELINE_LOG_STDERR";
const ENV_FAIL_FAST: &str = "LIFELINE_FAIL_FAST";
const ENV_CAPTURE_BACKTRACE: &str = "LIFELINE_CAPTURE_BACKTRACE";
const ENV_TRACK_STATS: &str = "LIFELINE_TRACK_STATS";
const ENV_POISON_FREED: &str = "LIFELINE_POISON_FREED";

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
    /// Environment variable parse error.
    #[error("failed to parse environment variable '{var}': {message}")]
    EnvParseError {
        /// Variable name.
        var: String,
        /// Error message.
        message: String,
    },
}

impl ConfigError {
    fn env(var: &str, value: &str, expected: &str) -> Self {
        ConfigError::EnvParseError {
            var: var.into(),
            message: format!("'{}' is not one of {}", value, expected),
        }
    }
}

/// Builder for LifetimeConfig.
#[derive(Debug, Clone, Default)]
pub struct LifetimeConfigBuilder {
    config: LifetimeConfig,
}

impl LifetimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
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

    /// Log to stderr (true) or stdout (false).
    pub fn log_to_stderr(mut self, use_stderr: bool) -> Self {
        self.config.log.use_stderr = use_stderr;
        self
    }

    /// Set the fail-fast mode.
    pub fn fail_fast_mode(mut self, mode: FailFastMode) -> Self {
        self.config.fail_fast.mode = mode;
        self
    }

    /// Enable or disable backtrace capture on fail-fast.
    pub fn capture_backtrace(mut self, enabled: bool) -> Self {
        self.config.fail_fast.capture_backtrace = enabled;
        self
    }

    /// Enable or disable lifetime event counting.
    pub fn track_stats(mut self, enabled: bool) -> Self {
        self.config.diagnostics.track_stats = enabled;
        self
    }

    /// Enable or disable poisoning of freed blocks.
    pub fn poison_freed(mut self, enabled: bool) -> Self {
        self.config.diagnostics.poison_freed = enabled;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<LifetimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> LifetimeConfig {
        self.config
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn require_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    parse_bool(value).ok_or_else(|| ConfigError::env(var, value, "true/false"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = LifetimeConfig::default();
        assert_eq!(config.log.level, LogLevel::Warn);
        assert_eq!(config.log.format, LogFormat::Plain);
        assert!(config.log.use_stderr);
        assert_eq!(config.fail_fast.mode, FailFastMode::Abort);
        assert!(!config.diagnostics.poison_freed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LifetimeConfig::builder()
            .log_level(LogLevel::Debug)
            .log_format(LogFormat::Json)
            .log_to_stderr(false)
            .fail_fast_mode(FailFastMode::Panic)
            .capture_backtrace(false)
            .track_stats(true)
            .poison_freed(true)
            .build()
            .unwrap();

        assert_eq!(config.log.level, LogLevel::Debug);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(!config.log.use_stderr);
        assert_eq!(config.fail_fast.mode, FailFastMode::Panic);
        assert!(!config.fail_fast.capture_backtrace);
        assert!(config.diagnostics.track_stats);
        assert!(config.diagnostics.poison_freed);
    }

    #[test]
    fn test_from_lookup_with_no_vars() {
        let config = LifetimeConfig::from_lookup(lookup(&[]));
        assert_eq!(config, LifetimeConfig::default());
    }

    #[test]
    fn test_from_lookup_reads_every_variable() {
        let config = LifetimeConfig::from_lookup(lookup(&[
            ("LIFELINE_LOG_LEVEL", "trace"),
            ("LIFELINE_LOG_FORMAT", "json"),
            ("LIFELINE_LOG_STDERR", "no"),
            ("LIFELINE_FAIL_FAST", "panic"),
            ("LIFELINE_CAPTURE_BACKTRACE", "off"),
            ("LIFELINE_TRACK_STATS", "1"),
            ("LIFELINE_POISON_FREED", "yes"),
        ]));

        assert_eq!(config.log.level, LogLevel::Trace);
        assert_eq!(config.log.format, LogFormat::Json);
        assert!(!config.log.use_stderr);
        assert_eq!(config.fail_fast.mode, FailFastMode::Panic);
        assert!(!config.fail_fast.capture_backtrace);
        assert!(config.diagnostics.track_stats);
        assert!(config.diagnostics.poison_freed);
    }

    #[test]
    fn test_lenient_lookup_ignores_bad_values() {
        let config = LifetimeConfig::from_lookup(lookup(&[
            ("LIFELINE_LOG_LEVEL", "loud"),
            ("LIFELINE_POISON_FREED", "maybe"),
        ]));
        assert_eq!(config.log.level, LogLevel::Warn);
        assert!(!config.diagnostics.poison_freed);
    }

    #[test]
    fn test_strict_lookup_rejects_bad_values() {
        let err = LifetimeConfig::try_from_lookup(lookup(&[("LIFELINE_FAIL_FAST", "explode")]))
            .unwrap_err();
        match err {
            ConfigError::EnvParseError { var, message } => {
                assert_eq!(var, "LIFELINE_FAIL_FAST");
                assert!(message.contains("explode"));
            }
            other => panic!("unexpected error: {}", other),
        }

        assert!(LifetimeConfig::try_from_lookup(lookup(&[("LIFELINE_TRACK_STATS", "2")])).is_err());
        assert!(LifetimeConfig::try_from_lookup(lookup(&[("LIFELINE_LOG_LEVEL", "info")])).is_ok());
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::InvalidValue {
            field: "fail_fast.mode".into(),
            message: "panic mode requires unwinding panic strategy".into(),
        };
        assert!(err.to_string().contains("fail_fast.mode"));
        assert!(err.to_string().contains("unwinding"));
    }
}
