//! Sandbox lifecycle management on top of the container engine
//!
//! A sandbox is a labelled container hosting the agent. The
//! `codepod.sandbox=<name>` label is the sole ownership marker: listing and
//! name lookups only ever see containers carrying it.

use crate::error::{Result, RunnerError};
use chrono::{DateTime, Utc};
use codepod_engine::{
    ContainerConfig, ContainerEngine, ContainerInfo, ContainerState, PortMapping,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Ownership label applied to every sandbox container
pub const SANDBOX_LABEL: &str = "codepod.sandbox";

/// In-container path the agent binary is injected to
pub const AGENT_DEST_PATH: &str = "/usr/local/bin/agent";

/// SSH port inside the sandbox
const SSH_CONTAINER_PORT: u16 = 22;

/// Grace period for engine stop before force kill
const STOP_GRACE_SECS: u32 = 10;

const DEFAULT_MEMORY_BYTES: i64 = 512 * 1024 * 1024;
const CPU_PERIOD: i64 = 100_000;

/// Sandbox lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    Pending,
    Running,
    Stopped,
    Failed,
    Deleting,
}

impl SandboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Stopped => "stopped",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Deleting => "deleting",
        }
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn status_from_state(state: ContainerState) -> SandboxStatus {
    match state {
        ContainerState::Running => SandboxStatus::Running,
        ContainerState::Created | ContainerState::Paused | ContainerState::Restarting => {
            SandboxStatus::Pending
        }
        ContainerState::Exited | ContainerState::Dead => SandboxStatus::Stopped,
        ContainerState::Removing => SandboxStatus::Deleting,
    }
}

/// Snapshot of the configuration a sandbox was created with
#[derive(Debug, Clone, Default)]
pub struct SandboxConfig {
    pub image: String,
    pub name: String,
    pub env: Vec<String>,
    pub memory_bytes: i64,
    pub cpu: i64,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
}

/// A sandbox instance
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub name: String,
    pub container_id: String,
    pub image: String,
    pub status: SandboxStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Published SSH host port (0 until the container has started)
    pub port: u16,
    pub config: Option<SandboxConfig>,
}

/// Options for creating a sandbox
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub name: String,
    pub image: String,
    pub env: HashMap<String, String>,
    /// Human-readable memory limit ("512Mi", "1G", ...); empty = 512 MiB
    pub memory: String,
    /// CPU weight in shares-units (multiplied by 1024)
    pub cpu: i64,
    /// Engine network mode; empty defaults to bridge
    pub network_mode: String,
    /// Host path of the agent binary to inject; empty disables injection
    pub agent_binary_path: String,
}

/// Manages sandbox containers on one engine
pub struct SandboxManager {
    engine: Arc<dyn ContainerEngine>,
}

impl SandboxManager {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self { engine }
    }

    /// Create a sandbox container in `pending` state
    ///
    /// Composes the container config (ownership label, env, parsed memory
    /// limit, cpu shares, SSH port binding) and, when an agent binary is
    /// configured, streams it into the container before it is ever started.
    pub async fn create(&self, opts: &CreateOptions) -> Result<Sandbox> {
        let memory_bytes = parse_memory(&opts.memory)?;

        let env: Vec<String> = opts
            .env
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let mut labels = HashMap::new();
        labels.insert(SANDBOX_LABEL.to_string(), opts.name.clone());

        let network_mode = if opts.network_mode.is_empty() {
            "bridge".to_string()
        } else {
            opts.network_mode.clone()
        };

        let inject_agent = !opts.agent_binary_path.is_empty();

        let config = ContainerConfig {
            image: opts.image.clone(),
            name: opts.name.clone(),
            env: env.clone(),
            labels: labels.clone(),
            memory_bytes,
            cpu_period: CPU_PERIOD,
            cpu_shares: opts.cpu * 1024,
            ports: vec![PortMapping::tcp(SSH_CONTAINER_PORT, 0)],
            // Injected sandboxes boot straight into the agent
            entrypoint: inject_agent.then(|| vec![AGENT_DEST_PATH.to_string()]),
            cmd: None,
            network_mode: network_mode.clone(),
            extra_hosts: Vec::new(),
        };

        let container_id = self.engine.create_container(&config).await?;

        if inject_agent {
            let binary = tokio::fs::read(&opts.agent_binary_path).await.map_err(|e| {
                RunnerError::AgentBinary {
                    path: opts.agent_binary_path.clone(),
                    source: e,
                }
            })?;

            self.engine
                .copy_file_to_container(&container_id, AGENT_DEST_PATH, &binary)
                .await?;

            tracing::info!(
                sandbox = %opts.name,
                container = %container_id,
                bytes = binary.len(),
                "agent binary injected"
            );
        }

        tracing::info!(sandbox = %opts.name, container = %container_id, image = %opts.image, "sandbox created");

        Ok(Sandbox {
            id: container_id.clone(),
            name: opts.name.clone(),
            container_id,
            image: opts.image.clone(),
            status: SandboxStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            port: 0,
            config: Some(SandboxConfig {
                image: opts.image.clone(),
                name: opts.name.clone(),
                env,
                memory_bytes,
                cpu: opts.cpu,
                network_mode,
                labels,
            }),
        })
    }

    /// Start a sandbox; an already-running container counts as success
    pub async fn start(&self, sb: &mut Sandbox) -> Result<()> {
        match self.engine.start_container(&sb.container_id).await {
            Ok(()) => {}
            Err(e) if e.is_running() => {
                tracing::debug!(sandbox = %sb.name, "container already running");
            }
            Err(e) => return Err(e.into()),
        }

        sb.status = SandboxStatus::Running;
        sb.started_at = Some(Utc::now());
        self.refresh_port(sb).await;

        tracing::info!(sandbox = %sb.name, port = sb.port, "sandbox started");
        Ok(())
    }

    /// Stop a sandbox with the 10 s engine grace period
    pub async fn stop(&self, sb: &mut Sandbox) -> Result<()> {
        self.engine
            .stop_container(&sb.container_id, STOP_GRACE_SECS)
            .await?;

        sb.status = SandboxStatus::Stopped;
        tracing::info!(sandbox = %sb.name, "sandbox stopped");
        Ok(())
    }

    /// Delete a sandbox (force-removes the container)
    pub async fn delete(&self, sb: &mut Sandbox) -> Result<()> {
        sb.status = SandboxStatus::Deleting;

        self.engine
            .remove_container(&sb.container_id, true)
            .await?;

        sb.status = SandboxStatus::Stopped;
        tracing::info!(sandbox = %sb.name, "sandbox deleted");
        Ok(())
    }

    /// Current engine-reported status of a sandbox
    pub async fn get_status(&self, sb: &Sandbox) -> Result<SandboxStatus> {
        let state = self.engine.container_status(&sb.container_id).await?;
        Ok(status_from_state(ContainerState::parse(&state)))
    }

    /// List all sandboxes on this runner
    ///
    /// Only containers carrying the ownership label are visible; anything
    /// else on the engine does not exist as far as the runner is concerned.
    pub async fn list(&self) -> Result<Vec<Sandbox>> {
        let containers = self.engine.list_containers(true).await?;

        Ok(containers
            .into_iter()
            .filter(|c| c.labels.contains_key(SANDBOX_LABEL))
            .map(sandbox_from_info)
            .collect())
    }

    /// Look up a sandbox by container id
    pub async fn get(&self, id: &str) -> Result<Sandbox> {
        self.list()
            .await?
            .into_iter()
            .find(|sb| sb.container_id == id)
            .ok_or_else(|| RunnerError::SandboxNotFound(id.to_string()))
    }

    /// Look up a sandbox by its name (= sandboxId)
    pub async fn get_by_name(&self, name: &str) -> Result<Sandbox> {
        self.list()
            .await?
            .into_iter()
            .find(|sb| sb.name == name)
            .ok_or_else(|| RunnerError::SandboxNotFound(name.to_string()))
    }

    /// Re-resolve the published SSH host port after a start
    async fn refresh_port(&self, sb: &mut Sandbox) {
        match self.engine.list_containers(true).await {
            Ok(containers) => {
                if let Some(info) = containers.iter().find(|c| c.id == sb.container_id) {
                    if let Some(port) = info
                        .ports
                        .iter()
                        .find(|p| p.container_port == SSH_CONTAINER_PORT)
                    {
                        sb.port = port.host_port;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(sandbox = %sb.name, error = %e, "failed to resolve published port");
            }
        }
    }
}

fn sandbox_from_info(info: ContainerInfo) -> Sandbox {
    let name = info
        .names
        .first()
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();

    let port = info
        .ports
        .iter()
        .find(|p| p.container_port == SSH_CONTAINER_PORT)
        .map(|p| p.host_port)
        .unwrap_or(0);

    Sandbox {
        id: info.id.clone(),
        name,
        container_id: info.id,
        image: info.image,
        status: status_from_state(info.state),
        created_at: info.created_at,
        started_at: None,
        port,
        config: None,
    }
}

/// Parse a human-readable memory limit into bytes
///
/// Accepted suffixes: `Mi`/`MiB`/`M` and `Gi`/`GiB`/`G` (binary), `KB`
/// (× 1024) and `GB` (× 1024³). An empty value defaults to 512 MiB. Any
/// other suffix is an error rather than a silent zero.
pub fn parse_memory(mem: &str) -> Result<i64> {
    let mem = mem.trim();
    if mem.is_empty() {
        return Ok(DEFAULT_MEMORY_BYTES);
    }

    let digits_end = mem
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(mem.len());
    let (num_str, suffix) = mem.split_at(digits_end);

    let value: i64 = num_str.parse().map_err(|_| RunnerError::InvalidMemory {
        value: mem.to_string(),
        reason: "missing numeric value".to_string(),
    })?;

    let multiplier: i64 = match suffix {
        "" => 1,
        "M" | "Mi" | "MiB" => 1024 * 1024,
        "G" | "Gi" | "GiB" => 1024 * 1024 * 1024,
        "KB" => 1024,
        "GB" => 1024 * 1024 * 1024,
        other => {
            return Err(RunnerError::InvalidMemory {
                value: mem.to_string(),
                reason: format!("unknown suffix '{}'", other),
            })
        }
    };

    Ok(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use codepod_engine::MockEngine;

    fn manager() -> (Arc<MockEngine>, SandboxManager) {
        let engine = Arc::new(MockEngine::new());
        let manager = SandboxManager::new(engine.clone());
        (engine, manager)
    }

    fn create_opts(name: &str) -> CreateOptions {
        CreateOptions {
            name: name.to_string(),
            image: "python:3.11".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_is_pending_with_label() {
        let (engine, manager) = manager();
        let sb = manager.create(&create_opts("sb1")).await.unwrap();

        assert_eq!(sb.status, SandboxStatus::Pending);
        assert!(!sb.container_id.is_empty());

        let container = engine.get_container(&sb.container_id).await.unwrap();
        assert_eq!(
            container.config.labels.get(SANDBOX_LABEL),
            Some(&"sb1".to_string())
        );
    }

    #[tokio::test]
    async fn test_create_env_and_resources() {
        let (engine, manager) = manager();
        let mut opts = create_opts("sb1");
        opts.env.insert("DEBUG".to_string(), "1".to_string());
        opts.memory = "1Gi".to_string();
        opts.cpu = 2;

        let sb = manager.create(&opts).await.unwrap();
        let container = engine.get_container(&sb.container_id).await.unwrap();

        assert!(container.config.env.contains(&"DEBUG=1".to_string()));
        assert_eq!(container.config.memory_bytes, 1024 * 1024 * 1024);
        assert_eq!(container.config.cpu_shares, 2048);
        assert_eq!(container.config.network_mode, "bridge");
    }

    #[tokio::test]
    async fn test_start_sets_running_and_port() {
        let (_, manager) = manager();
        let mut sb = manager.create(&create_opts("sb1")).await.unwrap();

        manager.start(&mut sb).await.unwrap();
        assert_eq!(sb.status, SandboxStatus::Running);
        assert!(sb.started_at.is_some());
        assert!(sb.port >= 32768);
    }

    #[tokio::test]
    async fn test_start_twice_is_success() {
        let (_, manager) = manager();
        let mut sb = manager.create(&create_opts("sb1")).await.unwrap();

        manager.start(&mut sb).await.unwrap();
        manager.start(&mut sb).await.unwrap();
        assert_eq!(sb.status, SandboxStatus::Running);
    }

    #[tokio::test]
    async fn test_stop_and_delete() {
        let (engine, manager) = manager();
        let mut sb = manager.create(&create_opts("sb1")).await.unwrap();
        manager.start(&mut sb).await.unwrap();

        manager.stop(&mut sb).await.unwrap();
        assert_eq!(sb.status, SandboxStatus::Stopped);

        manager.delete(&mut sb).await.unwrap();
        assert_eq!(sb.status, SandboxStatus::Stopped);
        assert_eq!(engine.container_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_status_transitions() {
        let (_, manager) = manager();
        let mut sb = manager.create(&create_opts("sb1")).await.unwrap();

        assert_eq!(
            manager.get_status(&sb).await.unwrap(),
            SandboxStatus::Pending
        );

        manager.start(&mut sb).await.unwrap();
        assert_eq!(
            manager.get_status(&sb).await.unwrap(),
            SandboxStatus::Running
        );

        manager.stop(&mut sb).await.unwrap();
        assert_eq!(
            manager.get_status(&sb).await.unwrap(),
            SandboxStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_list_is_label_scoped() {
        let (engine, manager) = manager();
        manager.create(&create_opts("sb1")).await.unwrap();
        manager.create(&create_opts("sb2")).await.unwrap();

        // An unlabelled container on the same engine must be invisible
        engine
            .create_container(&codepod_engine::ContainerConfig {
                image: "nginx".to_string(),
                name: "unrelated".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let sandboxes = manager.list().await.unwrap();
        assert_eq!(sandboxes.len(), 2);
        assert!(sandboxes.iter().all(|sb| sb.name.starts_with("sb")));
    }

    #[tokio::test]
    async fn test_get_by_name() {
        let (_, manager) = manager();
        let created = manager.create(&create_opts("lookup")).await.unwrap();

        let found = manager.get_by_name("lookup").await.unwrap();
        assert_eq!(found.container_id, created.container_id);

        let err = manager.get_by_name("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_get_by_container_id() {
        let (_, manager) = manager();
        let created = manager.create(&create_opts("sb1")).await.unwrap();

        let found = manager.get(&created.container_id).await.unwrap();
        assert_eq!(found.name, "sb1");

        assert!(manager.get("missing").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_agent_injection() {
        let (engine, manager) = manager();

        let dir = tempfile::tempdir().unwrap();
        let binary_path = dir.path().join("agent");
        std::fs::write(&binary_path, b"\x7fELF fake agent").unwrap();

        let mut opts = create_opts("sb1");
        opts.agent_binary_path = binary_path.to_string_lossy().into_owned();

        let sb = manager.create(&opts).await.unwrap();
        let container = engine.get_container(&sb.container_id).await.unwrap();

        assert_eq!(container.copied_files, vec![AGENT_DEST_PATH.to_string()]);
        assert_eq!(
            container.config.entrypoint,
            Some(vec![AGENT_DEST_PATH.to_string()])
        );
    }

    #[tokio::test]
    async fn test_agent_injection_missing_binary() {
        let (_, manager) = manager();
        let mut opts = create_opts("sb1");
        opts.agent_binary_path = "/nonexistent/agent".to_string();

        let err = manager.create(&opts).await.unwrap_err();
        assert!(matches!(err, RunnerError::AgentBinary { .. }));
    }

    #[test]
    fn test_parse_memory_table() {
        assert_eq!(parse_memory("").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512Mi").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512M").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("1024KB").unwrap(), 1024 * 1024);
        assert_eq!(parse_memory("2GB").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("512MiB").unwrap(), 512 * 1024 * 1024);
    }

    #[test]
    fn test_parse_memory_plain_bytes() {
        assert_eq!(parse_memory("1024").unwrap(), 1024);
    }

    #[test]
    fn test_parse_memory_rejects_garbage() {
        assert!(parse_memory("abc").is_err());
        assert!(parse_memory("512XB").is_err());
        assert!(parse_memory("Mi").is_err());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(SandboxStatus::Pending.to_string(), "pending");
        assert_eq!(SandboxStatus::Deleting.to_string(), "deleting");
    }
}
