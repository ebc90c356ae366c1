//! CodePod agent daemon
//!
//! Runs inside each sandbox container: SSH server for interactive access,
//! gRPC exec API, and a status heartbeat back to the CodePod server. Built
//! as a statically-linked binary (musl target) so the runner can inject it
//! into arbitrary images.

use anyhow::{Context, Result};
use clap::Parser;
use codepod_agent::reporter::StatusReport;
use codepod_agent::{
    Config, ExecServer, ProcessManager, Reporter, ReporterConfig, SessionRegistry, SshConfig,
    SshServer,
};
use codepod_observability::{init_logging, LogFormat, LogLevel, LoggingConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

/// CodePod agent: SSH access and heartbeat inside one sandbox
#[derive(Parser)]
#[command(name = "codepod-agent", version, about)]
struct Cli {
    /// Log level (trace, debug, info, warn, error); overrides AGENT_LOG_LEVEL
    #[arg(long)]
    log_level: Option<String>,

    /// Log format (json, pretty, compact); overrides AGENT_LOG_FORMAT
    #[arg(long)]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env("AGENT");
    if let Some(level) = &cli.log_level {
        logging.level = LogLevel::parse(level);
    }
    if let Some(format) = &cli.log_format {
        logging.format = LogFormat::parse(format);
    }
    let _guard = init_logging(&logging).context("failed to initialise logging")?;

    let config = Config::from_env();
    config.validate().context("invalid configuration")?;

    info!(sandbox = %config.agent.sandbox_id, "starting CodePod agent");

    let sessions = Arc::new(SessionRegistry::new(config.ssh.max_sessions));
    let processes = Arc::new(ProcessManager::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Heartbeat: initial report now, then every 30 s, terminal report on stop
    let reporter = Reporter::new(ReporterConfig {
        server_url: config.agent.server_url.clone(),
        sandbox_id: config.agent.sandbox_id.clone(),
        interval: Duration::from_secs(30),
    })
    .with_sessions(sessions.clone());

    let hostname = sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string());
    let heartbeat_task = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            reporter
                .start_heartbeat(shutdown, StatusReport::with_status("running", &hostname))
                .await;
        })
    };

    // Exec API; must come up before the SSH accept loop blocks this task
    let exec_server = ExecServer::new(
        config.grpc.port,
        config.agent.token.clone(),
        processes.clone(),
    );
    exec_server
        .start(shutdown_rx.clone())
        .await
        .context("failed to start exec service")?;

    let ssh_server = Arc::new(SshServer::new(
        SshConfig::from_agent_config(&config),
        sessions.clone(),
    ));

    let mut ssh_task = {
        let server = ssh_server.clone();
        tokio::spawn(async move { server.start().await })
    };

    // A premature SSH exit (e.g. bind failure) is fatal; otherwise run until
    // a shutdown signal arrives.
    tokio::select! {
        _ = wait_for_shutdown() => {}
        result = &mut ssh_task => {
            let _ = shutdown_tx.send(true);
            heartbeat_task.await.context("heartbeat task panicked")?;
            result.context("ssh task panicked")?.context("ssh server failed")?;
            anyhow::bail!("SSH server exited unexpectedly");
        }
    }
    info!("shutting down");

    // Order: heartbeat first so the terminal "stopped" report goes out, then
    // the SSH listener.
    let _ = shutdown_tx.send(true);
    heartbeat_task.await.context("heartbeat task panicked")?;

    ssh_server.stop();
    ssh_task
        .await
        .context("ssh task panicked")?
        .context("ssh server failed")?;

    info!("agent stopped");
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
