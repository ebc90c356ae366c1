//! CodePod Agent - in-sandbox SSH server and status heartbeat
//!
//! The agent runs inside each sandbox container. It serves SSH (interactive
//! shells over PTYs and one-shot execs), exposes a gRPC exec API, and posts
//! a periodic status heartbeat back to the CodePod server.

pub mod config;
pub mod error;
pub mod execsvc;
pub mod process;
pub mod pty;
pub mod reporter;
pub mod session;
pub mod ssh;

pub use config::Config;
pub use error::{AgentError, Result};
pub use execsvc::ExecServer;
pub use process::{ProcessInfo, ProcessManager, ProcessStatus, StartOptions};
pub use pty::{Pty, PtyAllocator, WindowSize};
pub use reporter::{Reporter, ReporterConfig, StatusReport};
pub use session::{Session, SessionConfig, SessionRegistry, SessionStatus, SessionType};
pub use ssh::{SshConfig, SshServer};
