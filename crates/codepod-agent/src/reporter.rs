//! Status heartbeat back to the CodePod server
//!
//! Sends an initial report, then a freshly collected status on every tick.
//! Cancellation triggers exactly one terminal report with status "stopped",
//! sent after the loop has exited so it goes out even though the shutdown
//! signal has already fired; the per-request timeout bounds it.

use crate::error::{AgentError, Result};
use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Default heartbeat cadence
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);

/// Per-request timeout for status posts
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One status document as POSTed to the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    #[serde(default)]
    pub sandbox_id: String,
    pub status: String,
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(rename = "memoryMB", default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub session_count: usize,
    #[serde(default)]
    pub uptime_secs: i64,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl StatusReport {
    /// A report carrying just a status string and hostname
    pub fn with_status(status: &str, hostname: &str) -> Self {
        Self {
            sandbox_id: String::new(),
            status: status.to_string(),
            cpu_percent: 0.0,
            memory_mb: 0,
            session_count: 0,
            uptime_secs: 0,
            hostname: hostname.to_string(),
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }
}

/// Reporter configuration
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    pub server_url: String,
    pub sandbox_id: String,
    /// Zero falls back to the 30 s default
    pub interval: Duration,
}

/// Sends status reports and drives the heartbeat loop
pub struct Reporter {
    config: ReporterConfig,
    http: reqwest::Client,
    sessions: Option<Arc<SessionRegistry>>,
}

impl Reporter {
    pub fn new(mut config: ReporterConfig) -> Self {
        if config.interval.is_zero() {
            config.interval = DEFAULT_INTERVAL;
        }

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            config,
            http,
            sessions: None,
        }
    }

    /// Fold the live SSH session count into collected reports
    pub fn with_sessions(mut self, sessions: Arc<SessionRegistry>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    /// POST one status document with a fresh timestamp
    pub async fn report(&self, status: &StatusReport) -> Result<()> {
        let mut body = status.clone();
        body.sandbox_id = self.config.sandbox_id.clone();
        body.timestamp = Utc::now();

        let url = format!(
            "{}/api/v1/sandboxes/{}/status",
            self.config.server_url.trim_end_matches('/'),
            self.config.sandbox_id
        );

        let response = self.http.post(&url).json(&body).send().await?;

        if response.status().as_u16() != 200 {
            return Err(AgentError::ServerStatus(response.status().as_u16()));
        }
        Ok(())
    }

    /// Run the heartbeat until `shutdown` fires
    ///
    /// The initial report is sent once (errors logged, not fatal); every
    /// interval after that a freshly collected status goes out. The loop
    /// always finishes with a single "stopped" report.
    pub async fn start_heartbeat(&self, mut shutdown: watch::Receiver<bool>, initial: StatusReport) {
        if let Err(e) = self.report(&initial).await {
            tracing::warn!(error = %e, "initial status report failed");
        }

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    let status = self.collect_status(&initial).await;
                    if let Err(e) = self.report(&status).await {
                        tracing::warn!(error = %e, "heartbeat failed");
                    }
                }
            }
        }

        // Terminal report, sent after the cancelled loop so the final state
        // transition is never lost; bounded by the request timeout.
        let mut final_status = initial.clone();
        final_status.status = "stopped".to_string();
        if let Err(e) = self.report(&final_status).await {
            tracing::warn!(error = %e, "terminal status report failed");
        }
    }

    /// Collect a fresh status from host introspection
    async fn collect_status(&self, base: &StatusReport) -> StatusReport {
        let uptime_secs = sysinfo::System::uptime() as i64;

        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let memory_mb = sys.used_memory() / 1024 / 1024;

        let session_count = match &self.sessions {
            Some(registry) => registry.count().await,
            None => base.session_count,
        };

        StatusReport {
            sandbox_id: String::new(),
            status: "running".to_string(),
            // Accurate CPU percent needs a sampling interval; reported as 0
            cpu_percent: 0.0,
            memory_mb,
            session_count,
            uptime_secs,
            hostname: base.hostname.clone(),
            timestamp: Utc::now(),
            metadata: base.metadata.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter(url: &str, interval: Duration) -> Reporter {
        Reporter::new(ReporterConfig {
            server_url: url.to_string(),
            sandbox_id: "sb-1".to_string(),
            interval,
        })
    }

    #[test]
    fn test_zero_interval_defaults() {
        let r = reporter("http://localhost", Duration::ZERO);
        assert_eq!(r.config.interval, DEFAULT_INTERVAL);
    }

    #[tokio::test]
    async fn test_report_posts_status() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/sandboxes/sb-1/status")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "sandboxId": "sb-1",
                "status": "running",
                "hostname": "box"
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let r = reporter(&server.url(), Duration::from_secs(30));
        r.report(&StatusReport::with_status("running", "box"))
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_report_non_200_is_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/sandboxes/sb-1/status")
            .with_status(500)
            .create_async()
            .await;

        let r = reporter(&server.url(), Duration::from_secs(30));
        let err = r
            .report(&StatusReport::with_status("running", "box"))
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ServerStatus(500)));
    }

    #[tokio::test]
    async fn test_heartbeat_sends_terminal_stopped_report() {
        let mut server = mockito::Server::new_async().await;
        let initial = server
            .mock("POST", "/api/v1/sandboxes/sb-1/status")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "status": "running"
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let stopped = server
            .mock("POST", "/api/v1/sandboxes/sb-1/status")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "status": "stopped"
            })))
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        // Interval far beyond the test lifetime: only initial + terminal fire
        let r = reporter(&server.url(), Duration::from_secs(600));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            r.start_heartbeat(rx, StatusReport::with_status("running", "box"))
                .await;
        });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        initial.assert_async().await;
        stopped.assert_async().await;
    }

    #[tokio::test]
    async fn test_collect_status_uses_registry_count() {
        let registry = Arc::new(SessionRegistry::new(10));
        registry
            .create(&crate::session::SessionConfig {
                session_type: Some(crate::session::SessionType::Exec),
                user: "u".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();

        let r = reporter("http://localhost", Duration::from_secs(30)).with_sessions(registry);
        let status = r
            .collect_status(&StatusReport::with_status("running", "box"))
            .await;

        assert_eq!(status.session_count, 1);
        assert_eq!(status.status, "running");
        assert!(status.uptime_secs >= 0);
    }

    #[test]
    fn test_wire_shape() {
        let mut report = StatusReport::with_status("running", "box");
        report.sandbox_id = "sb-1".to_string();
        report.memory_mb = 256;
        report.uptime_secs = 12;

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["sandboxId"], "sb-1");
        assert_eq!(value["memoryMB"], 256);
        assert_eq!(value["uptimeSecs"], 12);
        assert_eq!(value["sessionCount"], 0);
        // Empty metadata is omitted entirely
        assert!(value.get("metadata").is_none());
    }
}
