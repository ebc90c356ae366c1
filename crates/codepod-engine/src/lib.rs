//! CodePod container engine abstraction
//!
//! Exposes the `ContainerEngine` capability trait with two implementations:
//! a Docker adapter (bollard) and an in-memory fake for hermetic tests. The
//! fake is authoritative for the semantics the runner depends on.

pub mod engine;
pub mod engines;
pub mod error;

pub use engine::{
    ContainerConfig, ContainerEngine, ContainerInfo, ContainerState, LogStream, MockContainer,
    MockEngine, PortMapping, RegistryAuth,
};
pub use error::{EngineError, Result};

#[cfg(feature = "docker")]
pub use engines::DockerEngine;

use std::sync::Arc;

/// Engine host value that selects the in-memory fake
pub const MOCK_HOST: &str = "mock";

/// Create an engine from a `CODEPOD_DOCKER_HOST`-style value
///
/// `"mock"` or an empty host selects the in-memory fake; anything else is
/// treated as a Docker daemon address (`unix://...` or `tcp://...`).
pub async fn create_engine(host: &str) -> Result<Arc<dyn ContainerEngine>> {
    if host.is_empty() || host == MOCK_HOST {
        tracing::info!("using in-memory mock container engine");
        return Ok(Arc::new(MockEngine::new()));
    }

    #[cfg(feature = "docker")]
    {
        let engine = DockerEngine::connect(host).await?;
        Ok(Arc::new(engine))
    }

    #[cfg(not(feature = "docker"))]
    {
        Err(EngineError::Engine(format!(
            "docker support not compiled in, cannot use engine host '{}'",
            host
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_engine_mock() {
        let engine = create_engine("mock").await.unwrap();
        assert!(engine.list_containers(true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_engine_empty_host_is_mock() {
        let engine = create_engine("").await.unwrap();
        assert!(engine.list_containers(true).await.unwrap().is_empty());
    }
}
