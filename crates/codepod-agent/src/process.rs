//! Process manager
//!
//! Accounting for ad-hoc processes spawned outside the SSH session path (the
//! exec gRPC service drives this). Children are placed in their own session
//! so a kill reaches the whole process tree via the process group.

use crate::error::{AgentError, Result};
use chrono::{DateTime, Utc};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::RwLock;

/// Exit code reported for killed processes (128 + SIGKILL)
const KILLED_EXIT_CODE: i32 = 137;

/// How often `wait` re-checks the process status
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Process lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Finished => "finished",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Killed => "killed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProcessStatus::Running)
    }
}

/// Metadata snapshot of a managed process
#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub id: String,
    pub pid: i32,
    pub cmd: String,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub dir: String,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
}

/// Options for starting a process
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// `KEY=value` pairs layered over the agent's environment
    pub env: Vec<String>,
    /// Working directory; empty inherits the agent's
    pub dir: String,
    /// Bytes written to the child's stdin, which is then closed
    pub stdin: Option<Vec<u8>>,
    /// Kill the whole tree when the deadline passes
    pub timeout: Option<Duration>,
}

struct ProcessEntry {
    info: ProcessInfo,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Manages processes spawned inside the sandbox
pub struct ProcessManager {
    procs: Arc<RwLock<HashMap<String, ProcessEntry>>>,
    next_id: AtomicU64,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self {
            procs: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Spawn a child in a new session and track it
    ///
    /// Output pipes stay attached to the entry until a caller takes them
    /// with [`take_output`](Self::take_output). A background waiter records
    /// the exit code unless a prior kill already marked the entry.
    pub async fn start(&self, cmd: &str, args: &[&str], opts: &StartOptions) -> Result<ProcessInfo> {
        let seq = self.next_id.fetch_add(1, Ordering::SeqCst) % 10_000;
        let id = format!("proc-{}", seq);

        let mut command = Command::new(cmd);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if opts.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(false);

        if !opts.dir.is_empty() {
            command.current_dir(&opts.dir);
        }
        for pair in &opts.env {
            if let Some((k, v)) = pair.split_once('=') {
                command.env(k, v);
            }
        }

        // New session: the child becomes its own process-group leader, so
        // killpg(pid) reaps the whole tree.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid()
                    .map(|_| ())
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::Internal(format!("failed to start '{}': {}", cmd, e)))?;

        let pid = child.id().unwrap_or(0) as i32;

        if let Some(bytes) = opts.stdin.clone() {
            if let Some(mut stdin) = child.stdin.take() {
                tokio::spawn(async move {
                    let _ = stdin.write_all(&bytes).await;
                    let _ = stdin.shutdown().await;
                });
            }
        }

        let info = ProcessInfo {
            id: id.clone(),
            pid,
            cmd: cmd.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            env: opts.env.clone(),
            dir: opts.dir.clone(),
            exit_code: None,
            started_at: Utc::now(),
            finished_at: None,
            status: ProcessStatus::Running,
        };

        let entry = ProcessEntry {
            info: info.clone(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
        };

        {
            let mut procs = self.procs.write().await;
            procs.insert(id.clone(), entry);
        }

        // Background waiter records the terminal state
        let procs = self.procs.clone();
        let waiter_id = id.clone();
        let timeout = opts.timeout;
        tokio::spawn(async move {
            let status = match timeout {
                Some(deadline) => match tokio::time::timeout(deadline, child.wait()).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::warn!(process = %waiter_id, pid, "process deadline passed, killing group");
                        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
                        {
                            let mut procs = procs.write().await;
                            if let Some(entry) = procs.get_mut(&waiter_id) {
                                entry.info.status = ProcessStatus::Killed;
                                entry.info.exit_code = Some(KILLED_EXIT_CODE);
                                entry.info.finished_at = Some(Utc::now());
                            }
                        }
                        child.wait().await
                    }
                },
                None => child.wait().await,
            };

            let mut procs = procs.write().await;
            let Some(entry) = procs.get_mut(&waiter_id) else {
                return;
            };
            if entry.info.status == ProcessStatus::Killed {
                return;
            }

            match status {
                Ok(exit) => {
                    let code = exit
                        .code()
                        .or_else(|| exit.signal().map(|s| 128 + s))
                        .unwrap_or(1);
                    entry.info.exit_code = Some(code);
                    entry.info.finished_at = Some(Utc::now());
                    entry.info.status = if exit.success() {
                        ProcessStatus::Finished
                    } else {
                        ProcessStatus::Failed
                    };
                }
                Err(e) => {
                    tracing::warn!(process = %waiter_id, error = %e, "wait failed");
                    entry.info.exit_code = Some(1);
                    entry.info.finished_at = Some(Utc::now());
                    entry.info.status = ProcessStatus::Failed;
                }
            }
        });

        tracing::debug!(process = %id, pid, cmd = %cmd, "process started");
        Ok(info)
    }

    /// Snapshot of one process
    pub async fn get(&self, id: &str) -> Option<ProcessInfo> {
        let procs = self.procs.read().await;
        procs.get(id).map(|e| e.info.clone())
    }

    /// Snapshot of all tracked processes
    pub async fn list(&self) -> Vec<ProcessInfo> {
        let procs = self.procs.read().await;
        procs.values().map(|e| e.info.clone()).collect()
    }

    /// Take the output pipes for streaming (once)
    pub async fn take_output(&self, id: &str) -> Option<(ChildStdout, ChildStderr)> {
        let mut procs = self.procs.write().await;
        let entry = procs.get_mut(id)?;
        match (entry.stdout.take(), entry.stderr.take()) {
            (Some(out), Some(err)) => Some((out, err)),
            _ => None,
        }
    }

    /// Kill the whole process tree with SIGKILL
    pub async fn kill(&self, id: &str) -> Result<()> {
        let mut procs = self.procs.write().await;
        let entry = procs
            .get_mut(id)
            .ok_or_else(|| AgentError::ProcessNotFound(id.to_string()))?;

        if entry.info.status != ProcessStatus::Running {
            return Err(AgentError::ProcessNotRunning { id: id.to_string() });
        }

        killpg(Pid::from_raw(entry.info.pid), Signal::SIGKILL)
            .map_err(|e| AgentError::Internal(format!("failed to kill process group: {}", e)))?;

        entry.info.status = ProcessStatus::Killed;
        entry.info.exit_code = Some(KILLED_EXIT_CODE);
        entry.info.finished_at = Some(Utc::now());

        tracing::debug!(process = %id, pid = entry.info.pid, "process group killed");
        Ok(())
    }

    /// Poll until the process reaches a terminal state or the deadline passes
    pub async fn wait(&self, id: &str, timeout: Duration) -> Result<ProcessInfo> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let info = self
                .get(id)
                .await
                .ok_or_else(|| AgentError::ProcessNotFound(id.to_string()))?;

            if info.status.is_terminal() {
                return Ok(info);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AgentError::Timeout(format!("process {}", id)));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }

    /// Drop terminal entries that finished more than `max_age` ago
    pub async fn cleanup(&self, max_age: Duration) {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        let mut procs = self.procs.write().await;
        procs.retain(|_, entry| {
            !(entry.info.status.is_terminal()
                && entry.info.finished_at.map(|t| t < cutoff).unwrap_or(false))
        });
    }

    /// Number of running processes
    pub async fn count(&self) -> usize {
        let procs = self.procs.read().await;
        procs
            .values()
            .filter(|e| e.info.status == ProcessStatus::Running)
            .count()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}
