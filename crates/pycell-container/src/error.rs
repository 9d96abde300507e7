//! Error types for container provisioning and teardown

use std::time::Duration;

use thiserror::Error;

/// Result alias for container operations
pub type Result<T> = std::result::Result<T, ContainerError>;

/// Errors raised by the container controller.
///
/// Provisioning failures are surfaced only after any partially-created
/// container has been removed.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Invalid sandbox descriptor or allow-list
    #[error("configuration error: {0}")]
    Config(#[from] pycell_spec::SpecError),

    /// The Docker daemon is unreachable
    #[error("failed to connect to Docker daemon: {reason}")]
    Daemon { reason: String },

    /// Image pull failed
    #[error("failed to pull image {image}: {reason}")]
    PullFailed { image: String, reason: String },

    /// Pull policy is `Never` and the image is absent locally
    #[error("image {image} not present locally and pull policy is never")]
    ImageMissing { image: String },

    /// Allocation of an ephemeral host port failed
    #[error("failed to allocate host port: {reason}")]
    PortAllocation { reason: String },

    /// Container creation failed
    #[error("failed to create container {name}: {reason}")]
    CreateFailed { name: String, reason: String },

    /// Container start failed
    #[error("failed to start container {name}: {reason}")]
    StartFailed { name: String, reason: String },

    /// Container removal failed
    #[error("failed to remove container {name}: {reason}")]
    RemoveFailed { name: String, reason: String },

    /// An endpoint did not accept TCP connections before the deadline
    #[error("container {name} not reachable on port {port} within {timeout:?}")]
    LivenessTimeout {
        name: String,
        port: u16,
        timeout: Duration,
    },

    /// In-container command execution failed
    #[error("exec in container {name} failed: {reason}")]
    ExecFailed { name: String, reason: String },

    /// The requested operation is not supported in the container's mode,
    /// e.g. firewall installation in a root container
    #[error("unsupported mode: {reason}")]
    UnsupportedMode { reason: String },

    /// The firewall script ran but reported failure
    #[error("firewall installation failed: {output}")]
    FirewallFailed { output: String },
}
