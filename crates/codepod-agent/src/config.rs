//! Agent configuration loaded from `AGENT_*` environment variables

use crate::error::{AgentError, Result};
use base64::Engine as _;

const DEFAULT_HOST_KEY: &str = "/etc/ssh/ssh_host_rsa_key";

/// Server connection identity
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AgentSettings {
    /// Shared secret for SSH password auth and the exec API
    pub token: String,
    /// Base URL of the CodePod server
    pub server_url: String,
    /// Identifier of the sandbox this agent runs in
    pub sandbox_id: String,
}

/// SSH server settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSettings {
    pub port: u32,
    /// Host key paths; the first one is generated when missing
    pub host_keys: Vec<String>,
    pub max_sessions: usize,
    pub idle_timeout_secs: u64,
    /// Decoded CA public key (OpenSSH format); empty disables cert auth
    pub trusted_user_ca_keys: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            host_keys: vec![DEFAULT_HOST_KEY.to_string()],
            max_sessions: 10,
            idle_timeout_secs: 1800,
            trusted_user_ca_keys: String::new(),
        }
    }
}

/// Exec gRPC service settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcSettings {
    pub port: u32,
}

impl Default for GrpcSettings {
    fn default() -> Self {
        Self { port: 50052 }
    }
}

/// Complete agent configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub agent: AgentSettings,
    pub ssh: SshSettings,
    pub grpc: GrpcSettings,
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

fn parse_host_keys(value: &str) -> Vec<String> {
    let keys: Vec<String> = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    if keys.is_empty() {
        vec![DEFAULT_HOST_KEY.to_string()]
    } else {
        keys
    }
}

/// Decode the base64 CA key from the environment
///
/// A decode failure logs a warning and disables certificate auth rather than
/// refusing to start; the agent then accepts token auth only.
fn decode_ca_keys(encoded: &str) -> String {
    if encoded.is_empty() {
        return String::new();
    }

    match base64::engine::general_purpose::STANDARD.decode(encoded) {
        Ok(decoded) => match String::from_utf8(decoded) {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(error = %e, "CA key is not valid UTF-8, certificate auth disabled");
                String::new()
            }
        },
        Err(e) => {
            tracing::warn!(error = %e, "failed to decode CA key, certificate auth disabled");
            String::new()
        }
    }
}

impl Config {
    /// Load configuration from the process environment
    pub fn from_env() -> Self {
        let host_keys = match std::env::var("AGENT_HOST_KEYS") {
            Ok(v) if !v.is_empty() => parse_host_keys(&v),
            _ => vec![DEFAULT_HOST_KEY.to_string()],
        };

        Self {
            agent: AgentSettings {
                token: env_or("AGENT_TOKEN", ""),
                server_url: env_or("AGENT_SERVER_URL", ""),
                sandbox_id: env_or("AGENT_SANDBOX_ID", ""),
            },
            ssh: SshSettings {
                port: env_u32_or("AGENT_SSH_PORT", 22),
                host_keys,
                max_sessions: env_u32_or("AGENT_MAX_SESSIONS", 10) as usize,
                idle_timeout_secs: env_u32_or("AGENT_IDLE_TIMEOUT", 1800) as u64,
                trusted_user_ca_keys: decode_ca_keys(&env_or("AGENT_TRUSTED_USER_CA_KEYS", "")),
            },
            grpc: GrpcSettings {
                port: env_u32_or("AGENT_GRPC_PORT", 50052),
            },
        }
    }

    /// Validate the configuration; failures here are fatal at startup
    pub fn validate(&self) -> Result<()> {
        if self.agent.sandbox_id.is_empty() {
            return Err(AgentError::Configuration(
                "sandbox ID is required (AGENT_SANDBOX_ID)".to_string(),
            ));
        }
        if self.agent.token.is_empty() {
            return Err(AgentError::Configuration(
                "agent token is required (AGENT_TOKEN)".to_string(),
            ));
        }
        if self.agent.server_url.is_empty() {
            return Err(AgentError::Configuration(
                "agent server URL is required (AGENT_SERVER_URL)".to_string(),
            ));
        }
        if self.ssh.port == 0 || self.ssh.port > 65535 {
            return Err(AgentError::Configuration(format!(
                "SSH port {} out of range",
                self.ssh.port
            )));
        }
        if self.grpc.port == 0 || self.grpc.port > 65535 {
            return Err(AgentError::Configuration(format!(
                "gRPC port {} out of range",
                self.grpc.port
            )));
        }
        Ok(())
    }
}
