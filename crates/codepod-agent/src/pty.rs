//! Pseudo-terminal allocation
//!
//! Wraps `openpty` with a single allocator mutex so allocation and resize
//! never race the kernel tty-ioctl path. The master fd is switched to
//! non-blocking mode so the SSH byte pumps can drive it through `AsyncFd`.

use crate::error::{AgentError, Result};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::pty::{openpty, Winsize};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use tokio::sync::Mutex;

/// Terminal dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        // Conventional login-terminal geometry
        Self { cols: 80, rows: 24 }
    }
}

impl WindowSize {
    fn to_winsize(self) -> Winsize {
        Winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        }
    }
}

/// A master/slave pseudo-terminal pair
///
/// The pair is owned by exactly one session; closing the session closes both
/// ends. The slave end is taken once by the shell spawn, the master is dup'd
/// for the byte pumps.
#[derive(Debug)]
pub struct Pty {
    master: Option<OwnedFd>,
    slave: Option<OwnedFd>,
    pub window: WindowSize,
}

impl Pty {
    /// Borrow the master end (present until `close`)
    pub fn master_fd(&self) -> Option<BorrowedFd<'_>> {
        self.master.as_ref().map(|fd| fd.as_fd())
    }

    /// Take the slave end for wiring up a child's stdio
    pub fn take_slave(&mut self) -> Option<OwnedFd> {
        self.slave.take()
    }

    /// Duplicate the master end for async I/O
    ///
    /// The duplicate shares the open file description, so the non-blocking
    /// flag set at allocation applies to it as well.
    pub fn dup_master(&self) -> Result<OwnedFd> {
        let master = self
            .master
            .as_ref()
            .ok_or_else(|| AgentError::Pty("master already closed".to_string()))?;
        master
            .try_clone()
            .map_err(|e| AgentError::Pty(format!("failed to dup master: {}", e)))
    }

    /// Whether both ends have been released
    pub fn is_closed(&self) -> bool {
        self.master.is_none() && self.slave.is_none()
    }

    fn close_ends(&mut self) {
        // Close order: master first, then slave; dropping an OwnedFd closes it
        self.master.take();
        self.slave.take();
    }
}

/// Allocates and resizes PTY pairs under one mutex
pub struct PtyAllocator {
    lock: Mutex<()>,
}

impl PtyAllocator {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Open a new PTY pair with the default 24×80 window
    ///
    /// Fails with `ResourceExhausted` when the host tty table is full.
    pub async fn allocate(&self) -> Result<Pty> {
        self.allocate_with_window(WindowSize::default()).await
    }

    /// Open a new PTY pair with the given initial window
    pub async fn allocate_with_window(&self, window: WindowSize) -> Result<Pty> {
        let _guard = self.lock.lock().await;

        let winsize = window.to_winsize();
        let pair = openpty(Some(&winsize), None).map_err(|errno| match errno {
            Errno::EMFILE | Errno::ENFILE | Errno::EAGAIN | Errno::ENOSPC | Errno::ENXIO => {
                AgentError::ResourceExhausted(errno.to_string())
            }
            other => AgentError::Pty(format!("openpty failed: {}", other)),
        })?;

        set_nonblocking(pair.master.as_fd())?;

        Ok(Pty {
            master: Some(pair.master),
            slave: Some(pair.slave),
            window,
        })
    }

    /// Update the PTY window size
    pub async fn resize(&self, pty: &mut Pty, cols: u16, rows: u16) -> Result<()> {
        let _guard = self.lock.lock().await;

        let master = pty
            .master_fd()
            .ok_or_else(|| AgentError::Pty("cannot resize a closed pty".to_string()))?;

        let window = WindowSize { cols, rows };
        let winsize = window.to_winsize();

        // SAFETY: TIOCSWINSZ with a valid Winsize on an open master fd
        let ret = unsafe {
            nix::libc::ioctl(
                master.as_raw_fd(),
                nix::libc::TIOCSWINSZ,
                &winsize as *const Winsize,
            )
        };
        if ret < 0 {
            return Err(AgentError::Pty(format!(
                "TIOCSWINSZ failed: {}",
                Errno::last()
            )));
        }

        pty.window = window;
        Ok(())
    }

    /// Close both ends; safe to call more than once
    pub async fn close(&self, pty: &mut Pty) {
        let _guard = self.lock.lock().await;
        pty.close_ends();
    }
}

impl Default for PtyAllocator {
    fn default() -> Self {
        Self::new()
    }
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> Result<()> {
    let fd = fd.as_raw_fd();
    let flags =
        fcntl(fd, FcntlArg::F_GETFL).map_err(|e| AgentError::Pty(format!("F_GETFL failed: {}", e)))?;
    let new_flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(new_flags))
        .map_err(|e| AgentError::Pty(format!("F_SETFL failed: {}", e)))?;
    Ok(())
}
