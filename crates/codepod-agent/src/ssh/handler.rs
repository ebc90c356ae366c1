//! Per-connection SSH protocol handling
//!
//! One `ConnectionHandler` exists per accepted TCP connection. It processes
//! channel requests in arrival order until a terminal trigger (`shell`,
//! `exec`, `subsystem`); `env` and `pty-req` before that only update channel
//! state. When both `pty-req` and `exec` arrive, the later request wins and
//! the exec runs without a PTY.

use crate::error::AgentError;
use crate::session::{SessionConfig, SessionRegistry, SessionType};
use crate::ssh::auth::{verify_token, CertificateAuthority};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use russh::keys::Certificate;
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;

/// State shared by all connections of one SSH server
pub(crate) struct ServerState {
    pub token: String,
    pub ca: Option<CertificateAuthority>,
    pub sessions: Arc<SessionRegistry>,
}

/// Per-channel request state
#[derive(Default)]
struct ChannelState {
    /// Env requests are acknowledged and forwarded to the spawned command
    env: Vec<(String, String)>,
    term: String,
    /// Dimensions from a pty-req; marks the channel interactive
    pty_dims: Option<(u16, u16)>,
    /// Registry id once a terminal trigger created a session
    session_id: Option<String>,
    /// PTY master for pumping client data into the shell
    master: Option<Arc<AsyncFd<OwnedFd>>>,
    shell_pid: Option<i32>,
    /// A terminal trigger has been consumed
    started: bool,
}

/// Handles one SSH connection
pub(crate) struct ConnectionHandler {
    state: Arc<ServerState>,
    peer: Option<SocketAddr>,
    user: String,
    channels: HashMap<ChannelId, ChannelState>,
}

impl ConnectionHandler {
    pub(crate) fn new(state: Arc<ServerState>, peer: Option<SocketAddr>) -> Self {
        Self {
            state,
            peer,
            user: String::new(),
            channels: HashMap::new(),
        }
    }

    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }

    async fn teardown_channel(&mut self, channel: ChannelId) {
        if let Some(st) = self.channels.remove(&channel) {
            if let Some(pid) = st.shell_pid {
                // Hang up the whole foreground group, like a vanishing tty
                let _ = killpg(Pid::from_raw(pid), Signal::SIGHUP);
            }
            if let Some(id) = st.session_id {
                if self.state.sessions.get(&id).await.is_some() {
                    let _ = self.state.sessions.close(&id).await;
                }
            }
        }
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        let mut ids = Vec::new();
        for (_, st) in self.channels.drain() {
            if let Some(pid) = st.shell_pid {
                let _ = killpg(Pid::from_raw(pid), Signal::SIGHUP);
            }
            if let Some(id) = st.session_id {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let sessions = self.state.sessions.clone();
            handle.spawn(async move {
                for id in ids {
                    let _ = sessions.close(&id).await;
                }
            });
        }
    }
}

fn read_fd(fd: &OwnedFd, buf: &mut [u8]) -> std::io::Result<usize> {
    nix::unistd::read(fd.as_raw_fd(), buf)
        .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

fn write_fd(fd: &OwnedFd, buf: &[u8]) -> std::io::Result<usize> {
    nix::unistd::write(fd, buf).map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
}

/// Write all bytes to the PTY master, waiting for writability as needed
///
/// No in-memory buffering: the caller is suspended until the kernel accepts
/// the bytes, which is the backpressure path for channel→PTY data.
async fn write_all_master(master: &AsyncFd<OwnedFd>, mut data: &[u8]) {
    while !data.is_empty() {
        let mut guard = match master.writable().await {
            Ok(guard) => guard,
            Err(_) => return,
        };
        match guard.try_io(|inner| write_fd(inner.get_ref(), data)) {
            Ok(Ok(n)) => data = &data[n..],
            Ok(Err(_)) => return,
            Err(_would_block) => continue,
        }
    }
}

/// Pump PTY master output to the SSH channel until the shell exits
async fn pump_shell(
    master: Arc<AsyncFd<OwnedFd>>,
    handle: Handle,
    channel: ChannelId,
    mut child: tokio::process::Child,
    sessions: Arc<SessionRegistry>,
    session_id: String,
) {
    let mut buf = [0u8; 4096];
    loop {
        let mut guard = match master.readable().await {
            Ok(guard) => guard,
            Err(_) => break,
        };
        match guard.try_io(|inner| read_fd(inner.get_ref(), &mut buf)) {
            // 0 or EIO: all slave ends closed, the shell is gone
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if handle
                    .data(channel, CryptoVec::from(buf[..n].to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Ok(Err(_)) => break,
            Err(_would_block) => continue,
        }
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code().unwrap_or(1),
        Err(_) => 1,
    };

    let _ = handle.exit_status_request(channel, exit_code as u32).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;

    if sessions.get(&session_id).await.is_some() {
        let _ = sessions.close(&session_id).await;
    }

    tracing::debug!(session = %session_id, exit_code, "shell session ended");
}

/// Run an exec command without a PTY and report its outcome on the channel
async fn run_exec(
    command: String,
    env: Vec<(String, String)>,
    handle: Handle,
    channel: ChannelId,
    sessions: Arc<SessionRegistry>,
    session_id: String,
) {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(&command);
    for (k, v) in &env {
        cmd.env(k, v);
    }
    cmd.stdin(Stdio::null());

    let (exit_code, output) = match cmd.output().await {
        Ok(out) => {
            let mut combined = out.stdout;
            combined.extend_from_slice(&out.stderr);
            (out.status.code().unwrap_or(1), combined)
        }
        Err(e) => {
            // Spawn failures have no exit status; report the conventional 1
            (1, format!("failed to run command: {}\n", e).into_bytes())
        }
    };

    let _ = handle.exit_status_request(channel, exit_code as u32).await;
    if !output.is_empty() {
        let _ = handle.data(channel, CryptoVec::from(output)).await;
    }
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;

    if sessions.get(&session_id).await.is_some() {
        let _ = sessions.close(&session_id).await;
    }

    tracing::debug!(session = %session_id, exit_code, "exec session ended");
}

impl russh::server::Handler for ConnectionHandler {
    type Error = AgentError;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if verify_token(password.as_bytes(), self.state.token.as_bytes()) {
            self.user = user.to_string();
            tracing::info!(user = %user, peer = ?self.peer, "password auth accepted");
            Ok(Auth::Accept)
        } else {
            tracing::warn!(user = %user, peer = ?self.peer, "password auth rejected");
            Ok(Self::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        _key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        // Bare public keys are never trusted; only CA-signed certificates
        tracing::debug!(user = %user, "bare public key offered, rejecting");
        Ok(Self::reject())
    }

    async fn auth_openssh_certificate(
        &mut self,
        user: &str,
        certificate: &Certificate,
    ) -> Result<Auth, Self::Error> {
        let Some(ca) = &self.state.ca else {
            tracing::debug!(user = %user, "certificate offered but no CA configured");
            return Ok(Self::reject());
        };

        match ca.verify(certificate, user) {
            Ok(()) => {
                self.user = user.to_string();
                tracing::info!(user = %user, peer = ?self.peer, "certificate auth accepted");
                Ok(Auth::Accept)
            }
            Err(e) => {
                tracing::warn!(user = %user, peer = ?self.peer, error = %e, "certificate auth rejected");
                Ok(Self::reject())
            }
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(st) = self.channels.get_mut(&channel) {
            st.env
                .push((variable_name.to_string(), variable_value.to_string()));
            session.channel_success(channel)?;
        } else {
            session.channel_failure(channel)?;
        }
        Ok(())
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let Some(st) = self.channels.get_mut(&channel) else {
            session.channel_failure(channel)?;
            return Ok(());
        };

        st.term = term.to_string();
        st.pty_dims = Some((col_width as u16, row_height as u16));
        session.channel_success(channel)?;
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let user = self.user.clone();

        // Snapshot the channel state up front; holding the borrow across the
        // registry calls below is not possible.
        let (cols, rows, term, env) = match self.channels.get_mut(&channel) {
            Some(st) if !st.started => {
                st.started = true;
                let (cols, rows) = st.pty_dims.unwrap_or((0, 0));
                (cols, rows, st.term.clone(), st.env.clone())
            }
            _ => {
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let registry_session = match self
            .state
            .sessions
            .create(&SessionConfig {
                session_type: Some(SessionType::Interactive),
                user,
                command: None,
                cols,
                rows,
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting shell session");
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        // Wire the shell to the PTY slave and keep a master handle for both
        // byte-pump directions.
        let spawn_result = {
            let mut s = registry_session.lock().await;
            let session_id = s.id.clone();
            let pty = s.pty.as_mut().expect("interactive session carries a pty");

            match (pty.dup_master(), pty.take_slave()) {
                (Ok(master), Some(slave)) => {
                    match (slave.try_clone(), slave.try_clone()) {
                        (Ok(stdin), Ok(stdout)) => {
                            let mut cmd = Command::new("/bin/sh");
                            cmd.stdin(Stdio::from(stdin))
                                .stdout(Stdio::from(stdout))
                                .stderr(Stdio::from(slave))
                                .env("TERM", if term.is_empty() { "xterm" } else { &term })
                                .kill_on_drop(false);
                            for (k, v) in &env {
                                cmd.env(k, v);
                            }

                            // The child gets its own session with the PTY
                            // slave as controlling terminal, so job control
                            // signals reach the shell, not the agent.
                            unsafe {
                                cmd.pre_exec(|| {
                                    nix::unistd::setsid().map_err(|e| {
                                        std::io::Error::from_raw_os_error(e as i32)
                                    })?;
                                    if nix::libc::ioctl(
                                        nix::libc::STDIN_FILENO,
                                        nix::libc::TIOCSCTTY,
                                        0,
                                    ) < 0
                                    {
                                        // Some platforms attach implicitly
                                    }
                                    Ok(())
                                });
                            }

                            match cmd.spawn() {
                                Ok(child) => Ok((session_id, master, child)),
                                Err(e) => Err(format!("failed to start shell: {}", e)),
                            }
                        }
                        _ => Err("failed to clone pty slave".to_string()),
                    }
                }
                _ => Err("pty endpoints unavailable".to_string()),
            }
        };

        let (session_id, master, child) = match spawn_result {
            Ok(parts) => parts,
            Err(reason) => {
                tracing::warn!(error = %reason, "shell setup failed");
                let sid = registry_session.lock().await.id.clone();
                let _ = self.state.sessions.close(&sid).await;
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let master = Arc::new(
            AsyncFd::new(master).map_err(|e| AgentError::Pty(format!("AsyncFd: {}", e)))?,
        );

        if let Some(st) = self.channels.get_mut(&channel) {
            st.session_id = Some(session_id.clone());
            st.master = Some(master.clone());
            st.shell_pid = child.id().map(|p| p as i32);
        }

        session.channel_success(channel)?;

        let handle = session.handle();
        let sessions = self.state.sessions.clone();
        tokio::spawn(pump_shell(
            master, handle, channel, child, sessions, session_id,
        ));

        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let user = self.user.clone();
        let env = match self.channels.get_mut(&channel) {
            Some(st) if !st.started => {
                st.started = true;
                st.env.clone()
            }
            _ => {
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let command = String::from_utf8_lossy(data).into_owned();

        // Later request wins: a pty-req before this exec is ignored and the
        // command runs without a PTY.
        let registry_session = match self
            .state
            .sessions
            .create(&SessionConfig {
                session_type: Some(SessionType::Exec),
                user,
                command: Some(command.clone()),
                cols: 0,
                rows: 0,
            })
            .await
        {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "rejecting exec session");
                session.channel_failure(channel)?;
                return Ok(());
            }
        };

        let session_id = registry_session.lock().await.id.clone();
        if let Some(st) = self.channels.get_mut(&channel) {
            st.session_id = Some(session_id.clone());
        }

        session.channel_success(channel)?;

        let handle = session.handle();
        let sessions = self.state.sessions.clone();
        tokio::spawn(run_exec(command, env, handle, channel, sessions, session_id));

        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        // No subsystems are provided; the request is terminal regardless
        tracing::debug!(subsystem = %name, "subsystem requested, none available");
        if let Some(st) = self.channels.get_mut(&channel) {
            st.started = true;
        }
        session.channel_failure(channel)?;
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        if col_width == 0 || row_height == 0 {
            session.channel_failure(channel)?;
            return Ok(());
        }

        let session_id = self
            .channels
            .get(&channel)
            .and_then(|st| st.session_id.clone());

        match session_id {
            Some(id) => {
                match self
                    .state
                    .sessions
                    .resize(&id, col_width as u16, row_height as u16)
                    .await
                {
                    Ok(()) => session.channel_success(channel)?,
                    Err(e) => {
                        tracing::debug!(session = %id, error = %e, "window change failed");
                        session.channel_failure(channel)?;
                    }
                }
            }
            None => session.channel_failure(channel)?,
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        let master = self
            .channels
            .get(&channel)
            .and_then(|st| st.master.clone());

        if let Some(master) = master {
            write_all_master(&master, data).await;
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.teardown_channel(channel).await;
        Ok(())
    }
}
