//! Structured logging with JSON/pretty/compact output and optional file rotation

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::{FileLoggingConfig, LogFormat, LoggingConfig, RotationStrategy};
use crate::error::{ObservabilityError, Result};

/// Guard that must be held to keep the async file writer running
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Initialize logging with the given configuration
///
/// Returns a guard that must be held for the lifetime of the process so
/// buffered file output is flushed on exit. `RUST_LOG` takes precedence over
/// the configured level.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if let Some(ref directives) = config.filter_directives {
            EnvFilter::new(directives)
        } else {
            EnvFilter::new(config.level.as_str())
        }
    });

    let (file_writer, guard) = if let Some(file_config) = &config.file {
        let (writer, guard) = create_file_writer(file_config)?;
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    // Separate branches per format because of tracing-subscriber's layered types
    let result = match (config.format, file_writer) {
        (LogFormat::Pretty, Some(file_writer)) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).pretty())
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
        (LogFormat::Pretty, None) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).pretty())
            .try_init(),
        (LogFormat::Json, Some(file_writer)) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).json())
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
        (LogFormat::Json, None) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).json())
            .try_init(),
        (LogFormat::Compact, Some(file_writer)) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).compact())
            .with(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
        (LogFormat::Compact, None) => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(io::stdout).compact())
            .try_init(),
    };

    result.map_err(|e| ObservabilityError::AlreadyInitialised(e.to_string()))?;

    Ok(LogGuard::new(guard))
}

fn create_file_writer(
    config: &FileLoggingConfig,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let file_appender = match config.rotation {
        RotationStrategy::Daily => {
            tracing_appender::rolling::daily(&config.directory, &config.prefix)
        }
        RotationStrategy::Hourly => {
            tracing_appender::rolling::hourly(&config.directory, &config.prefix)
        }
        RotationStrategy::Never => {
            tracing_appender::rolling::never(&config.directory, &config.prefix)
        }
    };

    Ok(tracing_appender::non_blocking(file_appender))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogLevel;

    #[test]
    fn test_log_guard_creation() {
        let guard = LogGuard::new(None);
        assert!(guard._guard.is_none());
    }

    #[test]
    fn test_init_logging_is_not_reentrant() {
        let config = LoggingConfig {
            level: LogLevel::Debug,
            format: LogFormat::Compact,
            ..Default::default()
        };
        // First call in the test process wins; the second must report
        // AlreadyInitialised rather than panic.
        let first = init_logging(&config);
        let second = init_logging(&config);
        assert!(first.is_ok() || second.is_err());
    }
}
