//! HTTP client for the CodePod server
//!
//! The runner is a pure client of the server's HTTP/JSON API: it registers
//! once, polls for jobs, accepts and completes them, and pushes per-phase
//! sandbox status updates. Every request carries the `X-Runner-Id` header.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Errors from server communication
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport-level failure
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned a non-2xx status
    #[error("server returned {status} for {endpoint}")]
    Status { status: u16, endpoint: String },

    /// Response body did not match the expected shape
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Client-side configuration problem
    #[error("client configuration error: {0}")]
    Configuration(String),
}

impl ClientError {
    /// True when the server answered 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::Status { status: 404, .. })
    }
}

pub type Result<T, E = ClientError> = std::result::Result<T, E>;

/// A unit of work received from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub sandbox_id: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub cpu: i64,
    #[serde(default)]
    pub network_mode: String,
    /// Pre-assigned agent token; empty means the runner generates one
    #[serde(default)]
    pub token: String,
}

/// Per-phase sandbox status pushed to the server
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxStatusUpdate {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
struct RegisterRequest<'a> {
    id: &'a str,
    capacity: u32,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    success: bool,
    message: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<Job>,
}

/// Connection settings for the server client
#[derive(Debug, Clone)]
pub struct ServerClientConfig {
    pub server_url: String,
    pub runner_id: String,
    /// Bearer token; empty disables the Authorization header
    pub token: String,
    /// Capacity advertised at registration
    pub capacity: u32,
}

/// Long-lived HTTP client for the runner↔server API
#[derive(Debug)]
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    runner_id: String,
    token: String,
    capacity: u32,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

impl ServerClient {
    pub fn new(config: ServerClientConfig) -> Result<Self> {
        if config.server_url.is_empty() {
            return Err(ClientError::Configuration(
                "server URL is required".to_string(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: config.server_url.trim_end_matches('/').to_string(),
            runner_id: config.runner_id,
            token: config.token,
            capacity: config.capacity,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .header("X-Runner-Id", &self.runner_id)
            .header("Content-Type", "application/json");

        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }

        builder
    }

    fn check(&self, status: StatusCode, endpoint: &str) -> Result<()> {
        if status.is_success() {
            Ok(())
        } else {
            Err(ClientError::Status {
                status: status.as_u16(),
                endpoint: endpoint.to_string(),
            })
        }
    }

    /// Register this runner; advisory, polls carry the runner id anyway
    pub async fn register(&self) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/api/v1/runners/register")
            .json(&RegisterRequest {
                id: &self.runner_id,
                capacity: self.capacity,
            })
            .send()
            .await?;

        self.check(response.status(), "register")?;
        tracing::info!(runner = %self.runner_id, "runner registered");
        Ok(())
    }

    /// Fetch pending jobs for this runner
    pub async fn poll_jobs(&self) -> Result<Vec<Job>> {
        let response = self
            .request(reqwest::Method::GET, "/api/v1/jobs")
            .send()
            .await?;

        self.check(response.status(), "poll")?;

        let body: JobsResponse = response
            .json()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        Ok(body.jobs)
    }

    /// Claim a job for processing
    pub async fn accept_job(&self, job_id: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/jobs/{}/accept", job_id),
            )
            .send()
            .await?;

        self.check(response.status(), "accept")
    }

    /// Terminate a job with a success flag and message
    pub async fn complete_job(&self, job_id: &str, success: bool, message: &str) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/jobs/{}/complete", job_id),
            )
            .json(&CompleteRequest { success, message })
            .send()
            .await?;

        self.check(response.status(), "complete")
    }

    /// Delete a job record; 200 and 204 both count as success
    pub async fn delete_job(&self, job_id: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/api/v1/jobs/{}", job_id))
            .send()
            .await?;

        match response.status().as_u16() {
            200 | 204 => Ok(()),
            status => Err(ClientError::Status {
                status,
                endpoint: "delete_job".to_string(),
            }),
        }
    }

    /// Push a per-phase status update for a sandbox
    pub async fn update_sandbox_status(
        &self,
        sandbox_id: &str,
        update: &SandboxStatusUpdate,
    ) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/api/v1/sandboxes/{}/runner-status", sandbox_id),
            )
            .json(update)
            .send()
            .await?;

        self.check(response.status(), "runner-status")
    }

    /// Fetch the SSH CA public key used to sign user certificates
    ///
    /// The key comes back as plain text to preserve newlines.
    pub async fn get_ssh_ca_public_key(&self) -> Result<String> {
        let response = self
            .request(reqwest::Method::GET, "/api/v1/ssh-ca/public-key")
            .send()
            .await?;

        self.check(response.status(), "ssh-ca")?;

        let body = response
            .text()
            .await
            .map_err(|e| ClientError::InvalidResponse(e.to_string()))?;

        Ok(body.trim().to_string())
    }
}
