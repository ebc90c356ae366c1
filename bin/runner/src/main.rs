//! CodePod runner daemon
//!
//! Polls the CodePod server for sandbox jobs and reconciles them against the
//! local container engine. Configuration comes from `CODEPOD_*` environment
//! variables; the flags below only override logging.

use anyhow::{Context, Result};
use clap::Parser;
use codepod_observability::{init_logging, LogFormat, LogLevel, LoggingConfig};
use codepod_runner::{Config, Runner};
use std::sync::Arc;
use tracing::info;

/// CodePod runner: reconciles server jobs into sandbox containers
#[derive(Parser)]
#[command(name = "codepod-runner", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides CODEPOD_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, pretty, compact); overrides CODEPOD_LOG_FORMAT
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env("CODEPOD");
    if let Some(level) = &cli.log_level {
        logging.level = LogLevel::parse(level);
    }
    if let Some(format) = &cli.log_format {
        logging.format = LogFormat::parse(format);
    }
    let _guard = init_logging(&logging).context("failed to initialise logging")?;

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;

    info!(
        server = %config.server.url,
        engine = %config.docker.host,
        runner = %config.runner.id,
        "starting CodePod runner"
    );

    let runner = Arc::new(Runner::new(config).await.context("failed to build runner")?);

    let run_task = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };

    wait_for_shutdown().await;
    info!("shutdown signal received");

    runner.shutdown();
    run_task.await.context("runner task panicked")?;

    info!("runner stopped");
    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
