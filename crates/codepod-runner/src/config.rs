//! Runner configuration loaded from `CODEPOD_*` environment variables

use crate::error::{Result, RunnerError};

/// Server connection settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerConfig {
    /// Base URL of the CodePod server, e.g. `http://server:8080`
    pub url: String,
    /// Optional bearer token for server requests
    pub token: String,
}

/// Container engine settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DockerConfig {
    /// Engine socket (`unix://...`, `tcp://...`) or `"mock"` for the fake
    pub host: String,
    /// Network mode handed to created sandboxes (defaults to bridge)
    pub network: String,
}

/// Runner identity and capacity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    /// Unique runner identifier sent with every server request
    pub id: String,
    /// Advertised SSH host for sandboxes on this runner
    pub host: String,
    /// Maximum number of concurrent jobs advertised at registration
    pub max_jobs: u32,
}

/// Agent injection settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentConfig {
    /// Path to the statically-linked agent binary; empty disables injection
    pub binary_path: String,
    /// Fixed agent token; empty means a fresh token per sandbox
    pub token: String,
}

/// Complete runner configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub server: ServerConfig,
    pub docker: DockerConfig,
    pub runner: RunnerConfig,
    pub agent: AgentConfig,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32_or(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig {
                url: env_or("CODEPOD_SERVER_URL", ""),
                token: env_or("CODEPOD_SERVER_TOKEN", ""),
            },
            docker: DockerConfig {
                host: env_or("CODEPOD_DOCKER_HOST", "mock"),
                network: env_or("CODEPOD_DOCKER_NETWORK", "bridge"),
            },
            runner: RunnerConfig {
                id: env_or("CODEPOD_RUNNER_ID", "runner-1"),
                host: env_or("CODEPOD_RUNNER_HOST", "localhost"),
                max_jobs: env_u32_or("CODEPOD_MAX_JOBS", 10),
            },
            agent: AgentConfig {
                binary_path: env_or("CODEPOD_AGENT_BINARY_PATH", ""),
                token: env_or("CODEPOD_AGENT_TOKEN", ""),
            },
        }
    }

    /// Validate the configuration; failures here are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.server.url.is_empty() {
            return Err(RunnerError::Configuration(
                "server URL is required (CODEPOD_SERVER_URL)".to_string(),
            ));
        }
        if self.runner.id.is_empty() {
            return Err(RunnerError::Configuration(
                "runner id must not be empty".to_string(),
            ));
        }
        if self.runner.max_jobs == 0 {
            return Err(RunnerError::Configuration(
                "max jobs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            server: ServerConfig {
                url: "http://localhost:8080".to_string(),
                token: String::new(),
            },
            docker: DockerConfig {
                host: "mock".to_string(),
                network: "bridge".to_string(),
            },
            runner: RunnerConfig {
                id: "runner-1".to_string(),
                host: "localhost".to_string(),
                max_jobs: 10,
            },
            agent: AgentConfig::default(),
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validate_requires_server_url() {
        let mut config = base_config();
        config.server.url.clear();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("server URL"));
    }

    #[test]
    fn test_validate_rejects_zero_max_jobs() {
        let mut config = base_config();
        config.runner.max_jobs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_u32_fallback() {
        assert_eq!(env_u32_or("CODEPOD_TEST_NOT_SET_12345", 10), 10);
    }
}
