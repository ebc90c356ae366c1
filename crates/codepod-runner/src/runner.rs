//! Runner control loop
//!
//! Polls the server for jobs on a fixed tick and reconciles them into
//! container-engine operations. Jobs within a tick are dispatched serially;
//! the create-path idempotency below assumes that ordering and must not be
//! parallelised.

use crate::client::{Job, SandboxStatusUpdate, ServerClient, ServerClientConfig};
use crate::config::Config;
use crate::error::Result;
use crate::sandbox::{CreateOptions, Sandbox, SandboxManager, SandboxStatus};
use base64::Engine as _;
use codepod_engine::ContainerEngine;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use uuid::Uuid;

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The runner: owns the engine, sandbox manager and server client
pub struct Runner {
    config: Config,
    sandbox: SandboxManager,
    client: ServerClient,
    running: AtomicBool,
    shutdown: Notify,
}

impl Runner {
    /// Construct a runner from configuration
    ///
    /// `CODEPOD_DOCKER_HOST=mock` selects the in-memory engine; anything
    /// else is treated as a Docker daemon address.
    pub async fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let engine = codepod_engine::create_engine(&config.docker.host).await?;
        Self::with_parts(config, engine)
    }

    /// Construct a runner around an existing engine (used by tests)
    pub fn with_parts(config: Config, engine: Arc<dyn ContainerEngine>) -> Result<Self> {
        let client = ServerClient::new(ServerClientConfig {
            server_url: config.server.url.clone(),
            runner_id: config.runner.id.clone(),
            token: config.server.token.clone(),
            capacity: config.runner.max_jobs,
        })?;

        Ok(Self {
            config,
            sandbox: SandboxManager::new(engine),
            client,
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
        })
    }

    /// Advertised SSH host for sandboxes on this runner
    fn host(&self) -> &str {
        &self.config.runner.host
    }

    /// Run until `shutdown` is signalled
    ///
    /// Registration is advisory: a failure is logged and the loop continues,
    /// since every poll carries the runner id anyway.
    pub async fn run(&self) {
        self.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.client.register().await {
            tracing::warn!(error = %e, "failed to register with server, continuing");
        }

        tracing::info!(
            runner = %self.config.runner.id,
            poll_interval_secs = POLL_INTERVAL.as_secs(),
            "runner started, polling for jobs"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("runner shutting down");
                    break;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.poll_once().await;
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
    }

    /// Signal the poll loop to exit
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Whether the poll loop is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// One poll tick: fetch jobs and dispatch them serially
    pub async fn poll_once(&self) {
        let jobs = match self.client.poll_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                // Transient: retried on the next tick, no extra backoff
                tracing::warn!(error = %e, "failed to poll jobs");
                return;
            }
        };

        if jobs.is_empty() {
            return;
        }

        tracing::info!(count = jobs.len(), "received jobs");

        for job in &jobs {
            if let Err(e) = self.handle_job(job).await {
                tracing::error!(job = %job.id, error = %e, "failed to handle job");
            }
        }
    }

    /// Accept and dispatch a single job
    pub async fn handle_job(&self, job: &Job) -> Result<()> {
        tracing::info!(job = %job.id, job_type = %job.job_type, sandbox = %job.sandbox_id, "processing job");

        if let Err(e) = self.client.accept_job(&job.id).await {
            tracing::warn!(job = %job.id, error = %e, "failed to accept job");
            let _ = self
                .client
                .complete_job(&job.id, false, &format!("Failed to accept: {}", e))
                .await;
            return Err(e.into());
        }

        match job.job_type.as_str() {
            "create" => self.handle_create_job(job).await,
            "delete" => self.handle_delete_job(job).await,
            other => {
                let message = format!("unknown job type: {}", other);
                tracing::warn!(job = %job.id, "{message}");
                let _ = self.client.complete_job(&job.id, false, &message).await;
                Ok(())
            }
        }
    }

    /// Best-effort per-phase status report; failures are logged, not fatal
    async fn report_status(&self, sandbox_id: &str, update: SandboxStatusUpdate) {
        if let Err(e) = self.client.update_sandbox_status(sandbox_id, &update).await {
            tracing::warn!(sandbox = %sandbox_id, status = %update.status, error = %e,
                "failed to report sandbox status");
        }
    }

    /// Handle a create job, absorbing re-delivery of the same sandboxId
    ///
    /// Server-side deduplication is not assumed: a duplicate create for an
    /// already-running sandbox reports it running and completes successfully
    /// without touching the engine.
    async fn handle_create_job(&self, job: &Job) -> Result<()> {
        tracing::info!(sandbox = %job.sandbox_id, image = %job.image, "creating sandbox");

        if let Ok(mut existing) = self.sandbox.get_by_name(&job.sandbox_id).await {
            tracing::info!(
                sandbox = %job.sandbox_id,
                container = %existing.container_id,
                "sandbox already exists, checking status"
            );

            match self.sandbox.get_status(&existing).await {
                Ok(SandboxStatus::Running) => {
                    self.report_status(
                        &job.sandbox_id,
                        SandboxStatusUpdate {
                            status: "running".to_string(),
                            container_id: Some(existing.container_id.clone()),
                            port: Some(existing.port),
                            host: Some(self.host().to_string()),
                            message: Some("Sandbox already running".to_string()),
                        },
                    )
                    .await;

                    let _ = self
                        .client
                        .complete_job(&job.id, true, "Sandbox already running")
                        .await;
                    return Ok(());
                }
                Ok(_) | Err(_) => {
                    tracing::info!(sandbox = %job.sandbox_id, "existing sandbox not running, starting");
                    match self.sandbox.start(&mut existing).await {
                        Ok(()) => {
                            self.report_status(
                                &job.sandbox_id,
                                SandboxStatusUpdate {
                                    status: "running".to_string(),
                                    container_id: Some(existing.container_id.clone()),
                                    port: Some(existing.port),
                                    host: Some(self.host().to_string()),
                                    message: Some("Sandbox started".to_string()),
                                },
                            )
                            .await;

                            let _ = self
                                .client
                                .complete_job(&job.id, true, "Sandbox started")
                                .await;
                            return Ok(());
                        }
                        Err(e) => {
                            // Unstartable leftover: remove it and recreate below
                            tracing::warn!(sandbox = %job.sandbox_id, error = %e,
                                "failed to start existing sandbox, recreating");
                            if let Err(e) = self.sandbox.delete(&mut existing).await {
                                tracing::warn!(sandbox = %job.sandbox_id, error = %e,
                                    "failed to delete existing sandbox");
                            }
                        }
                    }
                }
            }
        }

        self.report_status(
            &job.sandbox_id,
            SandboxStatusUpdate {
                status: "creating".to_string(),
                message: Some("Creating container".to_string()),
                ..Default::default()
            },
        )
        .await;

        let agent_token = if !job.token.is_empty() {
            job.token.clone()
        } else if !self.config.agent.token.is_empty() {
            self.config.agent.token.clone()
        } else {
            Uuid::new_v4().to_string()
        };

        // Certificate auth is optional: without the CA key the agent falls
        // back to token-only authentication.
        let ca_public_key = match self.client.get_ssh_ca_public_key().await {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(error = %e, "failed to fetch SSH CA public key, token auth only");
                String::new()
            }
        };

        let mut env: HashMap<String, String> = HashMap::new();
        env.insert("AGENT_TOKEN".to_string(), agent_token);
        env.insert("AGENT_SANDBOX_ID".to_string(), job.sandbox_id.clone());
        env.insert(
            "AGENT_SERVER_URL".to_string(),
            self.config.server.url.clone(),
        );
        if !ca_public_key.is_empty() {
            // base64 so the PEM blob survives the env-var round trip
            env.insert(
                "AGENT_TRUSTED_USER_CA_KEYS".to_string(),
                base64::engine::general_purpose::STANDARD.encode(ca_public_key.as_bytes()),
            );
        }
        for (k, v) in &job.env {
            env.insert(k.clone(), v.clone());
        }

        let opts = CreateOptions {
            name: job.sandbox_id.clone(),
            image: job.image.clone(),
            env,
            memory: job.memory.clone(),
            cpu: job.cpu,
            network_mode: if job.network_mode.is_empty() {
                self.config.docker.network.clone()
            } else {
                job.network_mode.clone()
            },
            agent_binary_path: self.config.agent.binary_path.clone(),
        };

        let mut sb: Sandbox = match self.sandbox.create(&opts).await {
            Ok(sb) => sb,
            Err(e) => {
                tracing::error!(sandbox = %job.sandbox_id, error = %e, "failed to create sandbox");
                self.report_status(
                    &job.sandbox_id,
                    SandboxStatusUpdate {
                        status: "failed".to_string(),
                        message: Some(e.to_string()),
                        ..Default::default()
                    },
                )
                .await;
                let _ = self
                    .client
                    .complete_job(&job.id, false, &format!("Failed to create sandbox: {}", e))
                    .await;
                return Err(e);
            }
        };

        self.report_status(
            &job.sandbox_id,
            SandboxStatusUpdate {
                status: "starting".to_string(),
                container_id: Some(sb.container_id.clone()),
                message: Some("Starting container".to_string()),
                ..Default::default()
            },
        )
        .await;

        if let Err(e) = self.sandbox.start(&mut sb).await {
            tracing::error!(sandbox = %job.sandbox_id, error = %e, "failed to start sandbox");
            self.report_status(
                &job.sandbox_id,
                SandboxStatusUpdate {
                    status: "failed".to_string(),
                    message: Some(e.to_string()),
                    ..Default::default()
                },
            )
            .await;
            let _ = self
                .client
                .complete_job(&job.id, false, &format!("Failed to start sandbox: {}", e))
                .await;
            return Err(e);
        }

        self.report_status(
            &job.sandbox_id,
            SandboxStatusUpdate {
                status: "running".to_string(),
                container_id: Some(sb.container_id.clone()),
                port: Some(sb.port),
                host: Some(self.host().to_string()),
                message: Some("Sandbox running".to_string()),
            },
        )
        .await;

        if let Err(e) = self
            .client
            .complete_job(&job.id, true, "Sandbox created and started")
            .await
        {
            tracing::warn!(job = %job.id, error = %e, "failed to complete job");
        }

        tracing::info!(
            sandbox = %job.sandbox_id,
            container = %sb.container_id,
            port = sb.port,
            "sandbox created and started"
        );
        Ok(())
    }

    /// Handle a delete job; a missing target is a success
    async fn handle_delete_job(&self, job: &Job) -> Result<()> {
        tracing::info!(sandbox = %job.sandbox_id, "deleting sandbox");

        self.report_status(
            &job.sandbox_id,
            SandboxStatusUpdate {
                status: "deleting".to_string(),
                message: Some("Deleting container".to_string()),
                ..Default::default()
            },
        )
        .await;

        let mut sb = match self.sandbox.get_by_name(&job.sandbox_id).await {
            Ok(sb) => sb,
            Err(_) => {
                // Fall back to a container-id scan; delete jobs sometimes
                // carry an id where a name is expected.
                let candidates = self.sandbox.list().await.unwrap_or_default();
                match candidates.into_iter().find(|s| {
                    s.container_id.starts_with(&job.sandbox_id)
                        || job.sandbox_id.contains(&s.id)
                }) {
                    Some(sb) => {
                        tracing::info!(sandbox = %sb.name, "found delete target by container id");
                        sb
                    }
                    None => {
                        tracing::info!(sandbox = %job.sandbox_id, "sandbox not found, treating delete as complete");
                        let _ = self
                            .client
                            .complete_job(
                                &job.id,
                                true,
                                "Sandbox not found (may already be deleted)",
                            )
                            .await;
                        return Ok(());
                    }
                }
            }
        };

        if let Err(e) = self.sandbox.stop(&mut sb).await {
            tracing::error!(sandbox = %job.sandbox_id, error = %e, "failed to stop sandbox");
            let _ = self
                .client
                .complete_job(&job.id, false, &format!("Failed to stop sandbox: {}", e))
                .await;
            return Err(e);
        }

        if let Err(e) = self.sandbox.delete(&mut sb).await {
            tracing::error!(sandbox = %job.sandbox_id, error = %e, "failed to delete sandbox");
            self.report_status(
                &job.sandbox_id,
                SandboxStatusUpdate {
                    status: "failed".to_string(),
                    message: Some(e.to_string()),
                    ..Default::default()
                },
            )
            .await;
            let _ = self
                .client
                .complete_job(&job.id, false, &format!("Failed to delete sandbox: {}", e))
                .await;
            return Err(e);
        }

        let _ = self
            .client
            .complete_job(&job.id, true, "Sandbox deleted successfully")
            .await;

        tracing::info!(sandbox = %job.sandbox_id, "sandbox deleted");
        Ok(())
    }
}
