//! Engine implementations

#[cfg(feature = "docker")]
pub mod docker;

#[cfg(feature = "docker")]
pub use docker::DockerEngine;
