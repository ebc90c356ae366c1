//! SSH session registry
//!
//! Thread-safe set of live sessions keyed by id. A session exclusively owns
//! its PTY (interactive sessions only); closing the session closes both PTY
//! ends. The MaxSessions cap is enforced here, before any PTY is allocated.

use crate::error::{AgentError, Result};
use crate::pty::{Pty, PtyAllocator, WindowSize};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, RwLock};

/// What kind of work a session carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    /// Shell with a PTY
    Interactive,
    /// One-shot command, no PTY
    Exec,
    /// Named subsystem (sftp etc.)
    Subsystem,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Interactive => "interactive",
            SessionType::Exec => "exec",
            SessionType::Subsystem => "subsystem",
        }
    }
}

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Closing,
    Closed,
}

/// Parameters for creating a session
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub session_type: Option<SessionType>,
    pub user: String,
    /// Command line for exec sessions
    pub command: Option<String>,
    /// 0 falls back to 80
    pub cols: u16,
    /// 0 falls back to 24
    pub rows: u16,
}

/// A live session
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub session_type: SessionType,
    pub user: String,
    pub status: SessionStatus,
    pub pty: Option<Pty>,
    pub command: Option<String>,
    pub start_time: DateTime<Utc>,
    pub window_cols: u16,
    pub window_rows: u16,
}

/// Snapshot of a session for listing
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub session_type: SessionType,
    pub user: String,
    pub status: SessionStatus,
    pub start_time: DateTime<Utc>,
    pub window_cols: u16,
    pub window_rows: u16,
}

/// Guards the id → session map with a reader-writer lock
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Mutex<Session>>>>,
    allocator: PtyAllocator,
    max_sessions: usize,
    last_id_ns: AtomicU64,
}

impl SessionRegistry {
    /// Create a registry capping active sessions at `max_sessions`
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            allocator: PtyAllocator::new(),
            max_sessions,
            last_id_ns: AtomicU64::new(0),
        }
    }

    fn next_id(&self) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;

        // Keep ids strictly increasing even when the clock returns the same
        // nanosecond twice.
        let mut assigned = now;
        let _ = self
            .last_id_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                assigned = now.max(last + 1);
                Some(assigned)
            });

        format!("session-{}", assigned)
    }

    /// Create a session, allocating a PTY for interactive ones
    ///
    /// Zero window dimensions fall back to 80×24. Fails with `SessionLimit`
    /// before touching the PTY allocator when the cap is reached.
    pub async fn create(&self, cfg: &SessionConfig) -> Result<Arc<Mutex<Session>>> {
        {
            let sessions = self.sessions.read().await;
            if sessions.len() >= self.max_sessions {
                return Err(AgentError::SessionLimit {
                    limit: self.max_sessions,
                });
            }
        }

        let session_type = cfg.session_type.unwrap_or(SessionType::Interactive);
        let cols = if cfg.cols == 0 { 80 } else { cfg.cols };
        let rows = if cfg.rows == 0 { 24 } else { cfg.rows };

        let pty = if session_type == SessionType::Interactive {
            Some(
                self.allocator
                    .allocate_with_window(WindowSize { cols, rows })
                    .await?,
            )
        } else {
            None
        };

        let id = self.next_id();
        let session = Arc::new(Mutex::new(Session {
            id: id.clone(),
            session_type,
            user: cfg.user.clone(),
            status: SessionStatus::Active,
            pty,
            command: cfg.command.clone(),
            start_time: Utc::now(),
            window_cols: cols,
            window_rows: rows,
        }));

        let mut sessions = self.sessions.write().await;
        // Re-check under the write lock; two creates may have raced the cap
        if sessions.len() >= self.max_sessions {
            drop(sessions);
            let mut s = session.lock().await;
            if let Some(pty) = s.pty.as_mut() {
                self.allocator.close(pty).await;
            }
            return Err(AgentError::SessionLimit {
                limit: self.max_sessions,
            });
        }
        sessions.insert(id.clone(), session.clone());

        tracing::debug!(session = %id, session_type = session_type.as_str(), "session created");
        Ok(session)
    }

    /// Fetch a live session by id
    pub async fn get(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Snapshot of all live sessions; iteration order is unspecified
    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut result = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let s = session.lock().await;
            result.push(SessionInfo {
                id: s.id.clone(),
                session_type: s.session_type,
                user: s.user.clone(),
                status: s.status,
                start_time: s.start_time,
                window_cols: s.window_cols,
                window_rows: s.window_rows,
            });
        }
        result
    }

    /// Close a session: mark closing, release the PTY, drop the entry
    pub async fn close(&self, id: &str) -> Result<()> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions
                .remove(id)
                .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?
        };

        let mut s = session.lock().await;
        s.status = SessionStatus::Closing;
        if let Some(pty) = s.pty.as_mut() {
            self.allocator.close(pty).await;
        }
        s.status = SessionStatus::Closed;

        tracing::debug!(session = %id, "session closed");
        Ok(())
    }

    /// Resize the PTY of an interactive session
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<()> {
        let session = self
            .get(id)
            .await
            .ok_or_else(|| AgentError::SessionNotFound(id.to_string()))?;

        let mut s = session.lock().await;
        let pty = s
            .pty
            .as_mut()
            .ok_or_else(|| AgentError::Pty("session has no pty".to_string()))?;
        self.allocator.resize(pty, cols, rows).await?;
        s.window_cols = cols;
        s.window_rows = rows;
        Ok(())
    }

    /// Number of live (un-closed) sessions
    pub async fn count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interactive_cfg(user: &str) -> SessionConfig {
        SessionConfig {
            session_type: Some(SessionType::Interactive),
            user: user.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new(10);
        let session = registry.create(&interactive_cfg("root")).await.unwrap();
        let id = session.lock().await.id.clone();

        assert!(id.starts_with("session-"));
        let fetched = registry.get(&id).await.unwrap();
        assert_eq!(fetched.lock().await.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn test_defaults_applied() {
        let registry = SessionRegistry::new(10);
        let session = registry.create(&interactive_cfg("root")).await.unwrap();
        let s = session.lock().await;

        assert_eq!(s.window_cols, 80);
        assert_eq!(s.window_rows, 24);
        assert!(s.pty.is_some());
    }

    #[tokio::test]
    async fn test_exec_session_has_no_pty() {
        let registry = SessionRegistry::new(10);
        let session = registry
            .create(&SessionConfig {
                session_type: Some(SessionType::Exec),
                user: "root".to_string(),
                command: Some("ls -la".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let s = session.lock().await;
        assert!(s.pty.is_none());
        assert_eq!(s.command.as_deref(), Some("ls -la"));
    }

    #[tokio::test]
    async fn test_close_releases_pty_and_entry() {
        let registry = SessionRegistry::new(10);
        let session = registry.create(&interactive_cfg("root")).await.unwrap();
        let id = session.lock().await.id.clone();

        registry.close(&id).await.unwrap();

        assert!(registry.get(&id).await.is_none());
        assert_eq!(registry.count().await, 0);

        // Both PTY ends released on the session we still hold
        let s = session.lock().await;
        assert_eq!(s.status, SessionStatus::Closed);
        assert!(s.pty.as_ref().unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_close_unknown_session() {
        let registry = SessionRegistry::new(10);
        let err = registry.close("session-404").await.unwrap_err();
        assert!(matches!(err, AgentError::SessionNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_matches_live_count() {
        let registry = SessionRegistry::new(10);
        let s1 = registry.create(&interactive_cfg("user1")).await.unwrap();
        let _s2 = registry.create(&interactive_cfg("user2")).await.unwrap();

        assert_eq!(registry.list().await.len(), 2);
        assert_eq!(registry.count().await, 2);

        let id1 = s1.lock().await.id.clone();
        registry.close(&id1).await.unwrap();

        assert_eq!(registry.list().await.len(), 1);
        assert_eq!(registry.count().await, 1);
    }

    #[tokio::test]
    async fn test_session_cap() {
        let registry = SessionRegistry::new(2);
        let _a = registry.create(&interactive_cfg("u")).await.unwrap();
        let _b = registry.create(&interactive_cfg("u")).await.unwrap();

        let err = registry.create(&interactive_cfg("u")).await.unwrap_err();
        assert!(matches!(err, AgentError::SessionLimit { limit: 2 }));
    }

    #[tokio::test]
    async fn test_ids_are_unique_and_increasing() {
        let registry = SessionRegistry::new(100);
        let mut previous = 0u64;
        for _ in 0..10 {
            let session = registry
                .create(&SessionConfig {
                    session_type: Some(SessionType::Exec),
                    user: "u".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap();
            let id = session.lock().await.id.clone();
            let ns: u64 = id.strip_prefix("session-").unwrap().parse().unwrap();
            assert!(ns > previous);
            previous = ns;
        }
    }

    #[tokio::test]
    async fn test_resize_updates_session_window() {
        let registry = SessionRegistry::new(10);
        let session = registry.create(&interactive_cfg("root")).await.unwrap();
        let id = session.lock().await.id.clone();

        registry.resize(&id, 132, 43).await.unwrap();

        let s = session.lock().await;
        assert_eq!(s.window_cols, 132);
        assert_eq!(s.window_rows, 43);
    }
}
