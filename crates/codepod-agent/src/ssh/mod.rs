//! Embedded SSH server
//!
//! Binds a TCP listener, performs the SSH handshake per connection, and
//! multiplexes interactive shells and one-shot commands over the session
//! registry. Authentication accepts the shared token as password and, when a
//! CA is configured, OpenSSH user certificates signed by it.

pub mod auth;
pub mod handler;
pub mod hostkey;

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::session::SessionRegistry;
use auth::CertificateAuthority;
use handler::{ConnectionHandler, ServerState};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Notify;

/// SSH server settings
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub port: u32,
    pub host_keys: Vec<String>,
    pub idle_timeout_secs: u64,
    pub token: String,
    /// OpenSSH-format CA public key; empty disables certificate auth
    pub trusted_user_ca_keys: String,
}

impl SshConfig {
    pub fn from_agent_config(config: &Config) -> Self {
        Self {
            port: config.ssh.port,
            host_keys: config.ssh.host_keys.clone(),
            idle_timeout_secs: config.ssh.idle_timeout_secs,
            token: config.agent.token.clone(),
            trusted_user_ca_keys: config.ssh.trusted_user_ca_keys.clone(),
        }
    }
}

/// The agent's SSH daemon
pub struct SshServer {
    config: SshConfig,
    sessions: Arc<SessionRegistry>,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    bound_addr: Mutex<Option<SocketAddr>>,
}

impl SshServer {
    pub fn new(config: SshConfig, sessions: Arc<SessionRegistry>) -> Self {
        Self {
            config,
            sessions,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            bound_addr: Mutex::new(None),
        }
    }

    /// Bind the listener and serve connections until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let keys = hostkey::load_host_keys(&self.config.host_keys)?;

        // A broken CA key disables certificate auth but never blocks startup
        let ca = if self.config.trusted_user_ca_keys.is_empty() {
            None
        } else {
            match CertificateAuthority::parse(&self.config.trusted_user_ca_keys) {
                Ok(ca) => {
                    tracing::info!("certificate authentication enabled");
                    Some(ca)
                }
                Err(e) => {
                    tracing::warn!(error = %e, "invalid trusted CA key, certificate auth disabled");
                    None
                }
            }
        };

        let russh_config = Arc::new(russh::server::Config {
            inactivity_timeout: Some(Duration::from_secs(self.config.idle_timeout_secs)),
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            keys,
            ..Default::default()
        });

        let state = Arc::new(ServerState {
            token: self.config.token.clone(),
            ca,
            sessions: self.sessions.clone(),
        });

        let listener = TcpListener::bind(("0.0.0.0", self.config.port as u16))
            .await
            .map_err(|e| {
                AgentError::Configuration(format!(
                    "failed to bind SSH port {}: {}",
                    self.config.port, e
                ))
            })?;

        let local_addr = listener.local_addr().map_err(AgentError::from)?;
        *self.bound_addr.lock().unwrap() = Some(local_addr);
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(addr = %local_addr, "SSH server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "connection accepted");
                            let handler = ConnectionHandler::new(state.clone(), Some(peer));
                            let config = russh_config.clone();
                            tokio::spawn(async move {
                                match russh::server::run_stream(config, stream, handler).await {
                                    Ok(session) => {
                                        if let Err(e) = session.await {
                                            tracing::debug!(peer = %peer, error = %e, "connection ended");
                                        }
                                    }
                                    Err(e) => {
                                        tracing::debug!(peer = %peer, error = %e, "handshake failed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            // Accept errors during shutdown are expected
                            if self.running.load(Ordering::SeqCst) {
                                tracing::warn!(error = %e, "accept failed");
                            }
                        }
                    }
                }
            }
        }

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Signal the accept loop to exit
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
    }

    /// Whether the accept loop is live
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound address, once `start` has bound the listener
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock().unwrap()
    }
}
