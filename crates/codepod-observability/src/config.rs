//! Logging configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Log verbosity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level string; unknown values fall back to `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Console log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Machine-readable JSON lines
    #[default]
    Json,
    /// Human-readable multi-line output
    Pretty,
    /// Single-line human-readable output
    Compact,
}

impl LogFormat {
    /// Parse a format string; unknown values fall back to `Json`
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// File rotation strategy for the optional file layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// Optional rolling file output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileLoggingConfig {
    /// Directory to write log files into
    pub directory: PathBuf,

    /// Log file name prefix
    pub prefix: String,

    /// Rotation strategy
    #[serde(default)]
    pub rotation: RotationStrategy,
}

/// Main logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Minimum level when `RUST_LOG` is not set
    #[serde(default)]
    pub level: LogLevel,

    /// Console output format
    #[serde(default)]
    pub format: LogFormat,

    /// Extra filter directives (overrides `level` when present)
    pub filter_directives: Option<String>,

    /// Optional rolling file output (always JSON)
    pub file: Option<FileLoggingConfig>,
}

impl LoggingConfig {
    /// Build a logging config from `<prefix>_LOG_LEVEL` / `<prefix>_LOG_FORMAT`
    ///
    /// Missing or unparseable values fall back to the defaults (info / json),
    /// matching how the rest of the env-driven configuration behaves.
    pub fn from_env(prefix: &str) -> Self {
        let level = std::env::var(format!("{prefix}_LOG_LEVEL"))
            .map(|v| LogLevel::parse(&v))
            .unwrap_or_default();
        let format = std::env::var(format!("{prefix}_LOG_FORMAT"))
            .map(|v| LogFormat::parse(&v))
            .unwrap_or_default();

        Self {
            level,
            format,
            filter_directives: None,
            file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parse() {
        assert_eq!(LogLevel::parse("debug"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warn);
        assert_eq!(LogLevel::parse("bogus"), LogLevel::Info);
    }

    #[test]
    fn test_format_parse() {
        assert_eq!(LogFormat::parse("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::parse("compact"), LogFormat::Compact);
        assert_eq!(LogFormat::parse("anything"), LogFormat::Json);
    }

    #[test]
    fn test_from_env_defaults() {
        let config = LoggingConfig::from_env("CODEPOD_TEST_UNSET");
        assert_eq!(config.level, LogLevel::Info);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.file.is_none());
    }
}
