//! Abstract container engine interface
//!
//! Defines the `ContainerEngine` trait the sandbox manager runs against, plus
//! the in-memory `MockEngine`. The mock is authoritative for the semantics the
//! runner relies on: a real adapter that diverges from the mock is a bug in
//! the adapter.

use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;

/// Engine-reported container state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Created => "created",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Restarting => "restarting",
            ContainerState::Removing => "removing",
            ContainerState::Exited => "exited",
            ContainerState::Dead => "dead",
        }
    }

    /// Map an engine state string; unknown states come back as `Dead`
    pub fn parse(s: &str) -> Self {
        match s {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            _ => ContainerState::Dead,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single container→host port mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub container_port: u16,
    /// 0 asks the engine to assign a free host port
    pub host_port: u16,
    pub protocol: String,
}

impl PortMapping {
    pub fn tcp(container_port: u16, host_port: u16) -> Self {
        Self {
            container_port,
            host_port,
            protocol: "tcp".to_string(),
        }
    }
}

/// Container creation parameters
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub image: String,
    pub name: String,
    /// `KEY=value` pairs
    pub env: Vec<String>,
    pub labels: HashMap<String, String>,
    /// Hard memory limit in bytes (0 = unlimited)
    pub memory_bytes: i64,
    pub cpu_period: i64,
    pub cpu_shares: i64,
    pub ports: Vec<PortMapping>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub network_mode: String,
    /// `host:ip` entries appended to /etc/hosts
    pub extra_hosts: Vec<String>,
}

/// Container listing entry
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    pub image: String,
    /// Engine-style names (leading slash included)
    pub names: Vec<String>,
    pub state: ContainerState,
    pub status: String,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Registry credentials for pulls
#[derive(Debug, Clone, Default)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// Byte stream of combined stdout/stderr
pub type LogStream = BoxStream<'static, Result<Vec<u8>>>;

/// Abstract container engine
///
/// Implemented by the Docker adapter and the in-memory fake. All operations
/// are addressed by the engine-assigned container id.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container; fails with `NameConflict` when the name is taken
    async fn create_container(&self, config: &ContainerConfig) -> Result<String>;

    /// Start a container; `Running` when it is already up
    async fn start_container(&self, id: &str) -> Result<()>;

    /// Graceful stop with a force-kill deadline; no-op on a stopped container
    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<()>;

    /// Remove a container; `Busy` when it is running and `force` is false
    async fn remove_container(&self, id: &str, force: bool) -> Result<()>;

    /// List containers; `all=false` restricts to running ones
    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>>;

    /// Engine state string for a single container
    async fn container_status(&self, id: &str) -> Result<String>;

    /// Pull an image, short-circuiting when it is already present locally
    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()>;

    /// Whether the image is present locally
    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create a bridge network, returning the engine network id
    async fn create_network(&self, name: &str) -> Result<String>;

    /// Remove a network by id
    async fn remove_network(&self, network_id: &str) -> Result<()>;

    /// Stream combined stdout/stderr
    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream>;

    /// Stream a file into the container filesystem with mode 0755
    async fn copy_file_to_container(&self, id: &str, dest_path: &str, content: &[u8])
        -> Result<()>;
}

/// In-memory engine used by tests and `CODEPOD_DOCKER_HOST=mock`
pub struct MockEngine {
    state: tokio::sync::RwLock<MockState>,
}

#[derive(Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    images: HashMap<String, bool>,
    networks: HashMap<String, String>,
    next_id: u64,
    next_host_port: u16,
}

/// A fake container record
#[derive(Debug, Clone)]
pub struct MockContainer {
    pub id: String,
    pub config: ContainerConfig,
    pub state: ContainerState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    /// Destination paths of files streamed in via copy_file_to_container
    pub copied_files: Vec<String>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self {
            state: tokio::sync::RwLock::new(MockState {
                next_id: 1,
                next_host_port: 32768,
                ..Default::default()
            }),
        }
    }

    /// Test hook: fetch a fake container by id
    pub async fn get_container(&self, id: &str) -> Option<MockContainer> {
        let state = self.state.read().await;
        state.containers.get(id).cloned()
    }

    /// Test hook: force a container into a given state
    pub async fn set_container_state(&self, id: &str, new_state: ContainerState) {
        let mut state = self.state.write().await;
        if let Some(c) = state.containers.get_mut(id) {
            c.state = new_state;
        }
    }

    /// Test hook: number of containers the engine knows about
    pub async fn container_count(&self) -> usize {
        let state = self.state.read().await;
        state.containers.len()
    }
}

impl Default for MockEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerEngine for MockEngine {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let mut state = self.state.write().await;

        if state
            .containers
            .values()
            .any(|c| c.config.name == config.name)
        {
            return Err(EngineError::NameConflict {
                name: config.name.clone(),
            });
        }

        let id = format!("container-{}", state.next_id);
        state.next_id += 1;

        // Mirror the engine behaviour of assigning free host ports at create
        let mut config = config.clone();
        for port in config.ports.iter_mut() {
            if port.host_port == 0 {
                port.host_port = state.next_host_port;
                state.next_host_port += 1;
            }
        }

        state.containers.insert(
            id.clone(),
            MockContainer {
                id: id.clone(),
                config,
                state: ContainerState::Created,
                created_at: Utc::now(),
                started_at: None,
                copied_files: Vec::new(),
            },
        );

        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;

        if container.state == ContainerState::Running {
            return Err(EngineError::Running { id: id.to_string() });
        }

        container.state = ContainerState::Running;
        container.started_at = Some(Utc::now());
        Ok(())
    }

    async fn stop_container(&self, id: &str, _timeout_secs: u32) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;

        // Stopping a stopped container is a no-op
        container.state = ContainerState::Exited;
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;

        if container.state == ContainerState::Running && !force {
            return Err(EngineError::Busy {
                id: id.to_string(),
                reason: "container is running".to_string(),
            });
        }

        state.containers.remove(id);
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let state = self.state.read().await;
        let mut result = Vec::new();

        for c in state.containers.values() {
            if all || c.state == ContainerState::Running {
                result.push(ContainerInfo {
                    id: c.id.clone(),
                    image: c.config.image.clone(),
                    names: vec![format!("/{}", c.config.name)],
                    state: c.state,
                    status: c.state.as_str().to_string(),
                    ports: c.config.ports.clone(),
                    labels: c.config.labels.clone(),
                    created_at: c.created_at,
                });
            }
        }

        Ok(result)
    }

    async fn container_status(&self, id: &str) -> Result<String> {
        let state = self.state.read().await;
        state
            .containers
            .get(id)
            .map(|c| c.state.as_str().to_string())
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })
    }

    async fn pull_image(&self, image: &str, _auth: Option<&RegistryAuth>) -> Result<()> {
        let mut state = self.state.write().await;
        state.images.insert(image.to_string(), true);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.images.contains_key(image))
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let mut state = self.state.write().await;
        let id = format!("network-{}", state.next_id);
        state.next_id += 1;
        state.networks.insert(name.to_string(), id.clone());
        Ok(id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        state.networks.retain(|_, id| id != network_id);
        Ok(())
    }

    async fn container_logs(&self, id: &str, _follow: bool) -> Result<LogStream> {
        let state = self.state.read().await;
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;

        let line = format!("Mock logs for {}", container.config.name).into_bytes();
        Ok(stream::iter(vec![Ok(line)]).boxed())
    }

    async fn copy_file_to_container(
        &self,
        id: &str,
        dest_path: &str,
        _content: &[u8],
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound {
                id: id.to_string(),
                reason: "container not found".to_string(),
            })?;

        container.copied_files.push(dest_path.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(name: &str) -> ContainerConfig {
        ContainerConfig {
            image: "alpine:3.19".to_string(),
            name: name.to_string(),
            network_mode: "bridge".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_start() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();

        assert_eq!(engine.container_status(&id).await.unwrap(), "created");

        engine.start_container(&id).await.unwrap();
        assert_eq!(engine.container_status(&id).await.unwrap(), "running");
    }

    #[tokio::test]
    async fn test_name_conflict() {
        let engine = MockEngine::new();
        engine.create_container(&test_config("dup")).await.unwrap();

        let err = engine
            .create_container(&test_config("dup"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NameConflict { .. }));
    }

    #[tokio::test]
    async fn test_double_start_reports_running() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let err = engine.start_container(&id).await.unwrap_err();
        assert!(err.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();
        engine.start_container(&id).await.unwrap();

        engine.stop_container(&id, 10).await.unwrap();
        engine.stop_container(&id, 10).await.unwrap();
        assert_eq!(engine.container_status(&id).await.unwrap(), "exited");
    }

    #[tokio::test]
    async fn test_remove_running_requires_force() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();
        engine.start_container(&id).await.unwrap();

        let err = engine.remove_container(&id, false).await.unwrap_err();
        assert!(matches!(err, EngineError::Busy { .. }));

        engine.remove_container(&id, true).await.unwrap();
        assert!(engine.container_status(&id).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_list_filters_running() {
        let engine = MockEngine::new();
        let id1 = engine.create_container(&test_config("sb1")).await.unwrap();
        let _id2 = engine.create_container(&test_config("sb2")).await.unwrap();
        engine.start_container(&id1).await.unwrap();

        let running = engine.list_containers(false).await.unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].id, id1);

        let all = engine.list_containers(true).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_names_carry_leading_slash() {
        let engine = MockEngine::new();
        engine.create_container(&test_config("named")).await.unwrap();

        let all = engine.list_containers(true).await.unwrap();
        assert_eq!(all[0].names, vec!["/named".to_string()]);
    }

    #[tokio::test]
    async fn test_host_port_assignment() {
        let engine = MockEngine::new();
        let mut config = test_config("sb1");
        config.ports.push(PortMapping::tcp(22, 0));

        let id = engine.create_container(&config).await.unwrap();
        let container = engine.get_container(&id).await.unwrap();
        assert!(container.config.ports[0].host_port >= 32768);
    }

    #[tokio::test]
    async fn test_image_pull_and_exists() {
        let engine = MockEngine::new();
        assert!(!engine.image_exists("alpine:3.19").await.unwrap());

        engine.pull_image("alpine:3.19", None).await.unwrap();
        assert!(engine.image_exists("alpine:3.19").await.unwrap());
    }

    #[tokio::test]
    async fn test_copy_file_records_destination() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();

        engine
            .copy_file_to_container(&id, "/usr/local/bin/agent", b"\x7fELF")
            .await
            .unwrap();

        let container = engine.get_container(&id).await.unwrap();
        assert_eq!(container.copied_files, vec!["/usr/local/bin/agent"]);
    }

    #[tokio::test]
    async fn test_copy_file_to_missing_container() {
        let engine = MockEngine::new();
        let err = engine
            .copy_file_to_container("nope", "/tmp/x", b"data")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_logs_stream() {
        let engine = MockEngine::new();
        let id = engine.create_container(&test_config("sb1")).await.unwrap();

        let mut logs = engine.container_logs(&id, false).await.unwrap();
        let chunk = logs.next().await.unwrap().unwrap();
        assert!(String::from_utf8_lossy(&chunk).contains("sb1"));
    }

    #[tokio::test]
    async fn test_network_lifecycle() {
        let engine = MockEngine::new();
        let net_id = engine.create_network("codepod-test").await.unwrap();
        engine.remove_network(&net_id).await.unwrap();
    }
}
