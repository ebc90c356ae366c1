//! CodePod Observability - structured logging for runner and agent
//!
//! Provides the shared logging bootstrap:
//! - Structured logging with JSON/pretty/compact formats
//! - Optional rolling file output
//! - Environment-driven configuration (`<PREFIX>_LOG_LEVEL`, `<PREFIX>_LOG_FORMAT`)
//!
//! # Quick Start
//!
//! ```no_run
//! use codepod_observability::{init_logging, LoggingConfig};
//!
//! fn main() {
//!     let config = LoggingConfig::from_env("CODEPOD");
//!     let _guard = init_logging(&config).expect("Failed to init logging");
//!
//!     tracing::info!("Application started");
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::{FileLoggingConfig, LogFormat, LogLevel, LoggingConfig, RotationStrategy};
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
