//! Docker-based container engine using bollard
//!
//! Connects to the Docker daemon over a unix socket or TCP endpoint and maps
//! Docker API responses onto the engine error taxonomy the sandbox manager
//! branches on.

use crate::engine::{
    ContainerConfig, ContainerEngine, ContainerInfo, ContainerState, LogStream, PortMapping,
    RegistryAuth,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use bollard::auth::DockerCredentials;
use bollard::models::{ContainerCreateBody, HostConfig, NetworkCreateRequest, PortBinding};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use std::collections::HashMap;

/// Docker engine adapter
pub struct DockerEngine {
    docker: Docker,
}

impl std::fmt::Debug for DockerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerEngine").finish_non_exhaustive()
    }
}

const CONNECT_TIMEOUT_SECS: u64 = 120;

impl DockerEngine {
    /// Connect to the daemon at `host` and verify the connection with a ping
    ///
    /// `host` accepts `unix://` socket paths and `tcp://`/`http://` endpoints.
    /// An empty host uses the platform default socket.
    pub async fn connect(host: &str) -> Result<Self> {
        let docker = if host.is_empty() {
            Docker::connect_with_local_defaults()
        } else if host.starts_with("unix://") {
            Docker::connect_with_unix(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        } else {
            Docker::connect_with_http(host, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
        }
        .map_err(|e| EngineError::Engine(format!("failed to connect to Docker: {}", e)))?;

        docker
            .ping()
            .await
            .map_err(|e| EngineError::Engine(format!("Docker ping failed: {}", e)))?;

        tracing::info!(host = %host, "Connected to Docker daemon");
        Ok(Self { docker })
    }

    /// Wrap a pre-configured bollard client
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

/// Map a bollard error to the engine taxonomy
fn map_err(id: &str, err: bollard::errors::Error) -> EngineError {
    match err {
        bollard::errors::Error::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 => EngineError::NotFound {
                id: id.to_string(),
                reason: message,
            },
            409 => EngineError::Busy {
                id: id.to_string(),
                reason: message,
            },
            304 => EngineError::Running { id: id.to_string() },
            _ => EngineError::Engine(format!("{}: {}", status_code, message)),
        },
        other => EngineError::Engine(other.to_string()),
    }
}

/// Parse an image reference into name and tag
fn parse_image_ref(image: &str) -> (&str, &str) {
    // Digest references (image@sha256:...) are pulled whole
    if image.contains('@') {
        return (image, "");
    }

    if let Some((name, tag)) = image.rsplit_once(':') {
        // A '/' after the ':' means the colon belonged to a registry port
        if !tag.contains('/') {
            return (name, tag);
        }
    }

    (image, "latest")
}

fn build_host_config(config: &ContainerConfig) -> HostConfig {
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for port in &config.ports {
        let key = format!("{}/{}", port.container_port, port.protocol);
        let binding = PortBinding {
            host_ip: Some("0.0.0.0".to_string()),
            host_port: if port.host_port > 0 {
                Some(port.host_port.to_string())
            } else {
                // Empty string asks the daemon for an ephemeral port
                Some(String::new())
            },
        };
        port_bindings.insert(key, Some(vec![binding]));
    }

    HostConfig {
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        memory: (config.memory_bytes > 0).then_some(config.memory_bytes),
        cpu_period: (config.cpu_period > 0).then_some(config.cpu_period),
        cpu_shares: (config.cpu_shares > 0).then_some(config.cpu_shares),
        network_mode: (!config.network_mode.is_empty()).then(|| config.network_mode.clone()),
        extra_hosts: (!config.extra_hosts.is_empty()).then(|| config.extra_hosts.clone()),
        ..Default::default()
    }
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create_container(&self, config: &ContainerConfig) -> Result<String> {
        let exposed_ports: Vec<String> = config
            .ports
            .iter()
            .map(|p| format!("{}/{}", p.container_port, p.protocol))
            .collect();

        let body = ContainerCreateBody {
            image: Some(config.image.clone()),
            env: if config.env.is_empty() {
                None
            } else {
                Some(config.env.clone())
            },
            labels: if config.labels.is_empty() {
                None
            } else {
                Some(config.labels.clone())
            },
            entrypoint: config.entrypoint.clone(),
            cmd: config.cmd.clone(),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(build_host_config(config)),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: Some(config.name.clone()),
            platform: String::new(),
        };

        tracing::info!(container = %config.name, image = %config.image, "creating container");

        let response = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } => EngineError::NameConflict {
                    name: config.name.clone(),
                },
                other => map_err(&config.name, other),
            })?;

        tracing::info!(container = %config.name, id = %response.id, "container created");
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(|e| map_err(id, e))?;

        tracing::info!(container = %id, "container started");
        Ok(())
    }

    async fn stop_container(&self, id: &str, timeout_secs: u32) -> Result<()> {
        let options = StopContainerOptions {
            t: Some(timeout_secs as i32),
            signal: None,
        };

        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // 304: already stopped, which callers treat as success
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(map_err(id, e)),
        }?;

        tracing::info!(container = %id, "container stopped");
        Ok(())
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<()> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };

        self.docker
            .remove_container(id, Some(options))
            .await
            .map_err(|e| map_err(id, e))?;

        tracing::info!(container = %id, "container removed");
        Ok(())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions {
            all,
            ..Default::default()
        };

        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| EngineError::Engine(e.to_string()))?;

        let mut result = Vec::with_capacity(containers.len());
        for c in containers {
            let state_str = c.state.map(|s| s.to_string()).unwrap_or_default();
            let ports = c
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| PortMapping {
                    container_port: p.private_port as u16,
                    host_port: p.public_port.unwrap_or(0) as u16,
                    protocol: p
                        .typ
                        .map(|t| t.to_string())
                        .unwrap_or_else(|| "tcp".to_string()),
                })
                .collect();

            result.push(ContainerInfo {
                id: c.id.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                state: ContainerState::parse(&state_str),
                status: c.status.unwrap_or_default(),
                ports,
                labels: c.labels.unwrap_or_default(),
                created_at: c
                    .created
                    .and_then(|secs| DateTime::from_timestamp(secs, 0))
                    .unwrap_or_else(Utc::now),
            });
        }

        Ok(result)
    }

    async fn container_status(&self, id: &str) -> Result<String> {
        let inspect = self
            .docker
            .inspect_container(id, None)
            .await
            .map_err(|e| map_err(id, e))?;

        let status = inspect
            .state
            .and_then(|s| s.status)
            .map(|s| s.to_string())
            .unwrap_or_else(|| "dead".to_string());

        Ok(status)
    }

    async fn pull_image(&self, image: &str, auth: Option<&RegistryAuth>) -> Result<()> {
        // Short-circuit when the image is already present
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image = %image, "image already present, skipping pull");
            return Ok(());
        }

        let (name, tag) = parse_image_ref(image);
        tracing::info!(image = %image, name = %name, tag = %tag, "pulling image");

        let options = CreateImageOptions {
            from_image: Some(name.to_string()),
            tag: if tag.is_empty() {
                None
            } else {
                Some(tag.to_string())
            },
            ..Default::default()
        };

        let credentials = auth.map(|a| DockerCredentials {
            username: Some(a.username.clone()),
            password: Some(a.password.clone()),
            serveraddress: (!a.server_address.is_empty()).then(|| a.server_address.clone()),
            ..Default::default()
        });

        let mut stream = self.docker.create_image(Some(options), None, credentials);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(EngineError::PullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!(image = %image, "image pulled");
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(EngineError::Engine(e.to_string())),
        }
    }

    async fn create_network(&self, name: &str) -> Result<String> {
        let request = NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ..Default::default()
        };

        let response = self
            .docker
            .create_network(request)
            .await
            .map_err(|e| map_err(name, e))?;

        tracing::info!(network = %name, id = %response.id, "network created");
        Ok(response.id)
    }

    async fn remove_network(&self, network_id: &str) -> Result<()> {
        self.docker
            .remove_network(network_id)
            .await
            .map_err(|e| map_err(network_id, e))
    }

    async fn container_logs(&self, id: &str, follow: bool) -> Result<LogStream> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            follow,
            tail: "all".to_string(),
            ..Default::default()
        };

        let id_owned = id.to_string();
        let stream = self
            .docker
            .logs(id, Some(options))
            .map(move |item| match item {
                Ok(log_output) => Ok(log_output.into_bytes().to_vec()),
                Err(e) => Err(map_err(&id_owned, e)),
            })
            .boxed();

        Ok(stream)
    }

    async fn copy_file_to_container(
        &self,
        id: &str,
        dest_path: &str,
        content: &[u8],
    ) -> Result<()> {
        // The archive is extracted at `/`, entry paths are relative
        let rel_path = dest_path.trim_start_matches('/');

        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);

        let mut builder = tar::Builder::new(Vec::new());
        builder
            .append_data(&mut header, rel_path, content)
            .map_err(|e| EngineError::Engine(format!("failed to build tar archive: {}", e)))?;
        let archive = builder
            .into_inner()
            .map_err(|e| EngineError::Engine(format!("failed to finish tar archive: {}", e)))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };

        self.docker
            .upload_to_container(id, Some(options), bollard::body_full(archive.into()))
            .await
            .map_err(|e| map_err(id, e))?;

        tracing::debug!(container = %id, dest = %dest_path, "file copied into container");
        Ok(())
    }
}
