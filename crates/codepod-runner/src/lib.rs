//! CodePod Runner - reconciles server-issued jobs into container operations
//!
//! The runner registers with the central server, polls for create/delete
//! jobs, provisions sandbox containers on its local engine, injects the
//! agent binary, and reports per-phase sandbox status back to the server.

pub mod client;
pub mod config;
pub mod error;
pub mod runner;
pub mod sandbox;

pub use client::{ClientError, Job, SandboxStatusUpdate, ServerClient, ServerClientConfig};
pub use config::Config;
pub use error::{Result, RunnerError};
pub use runner::Runner;
pub use sandbox::{
    parse_memory, CreateOptions, Sandbox, SandboxManager, SandboxStatus, AGENT_DEST_PATH,
    SANDBOX_LABEL,
};
