//! Error types for the spec crate

use thiserror::Error;

/// Errors raised while validating sandbox or tool-server specifications.
///
/// These are configuration errors: they are raised synchronously, before any
/// container or network operation, and are never retried.
#[derive(Debug, Error)]
pub enum SpecError {
    /// Image reference is empty or malformed
    #[error("invalid image reference: {reason}")]
    InvalidImage { reason: String },

    /// A fixed host port is out of range
    #[error("invalid host port {port}: {reason}")]
    InvalidPort { port: u32, reason: String },

    /// A bind mount violates the host-absolute / container-relative rule
    #[error("invalid bind mount {host} -> {container}: {reason}")]
    InvalidBind {
        host: String,
        container: String,
        reason: String,
    },

    /// An environment variable key is unusable
    #[error("invalid environment variable {key:?}: {reason}")]
    InvalidEnv { key: String, reason: String },

    /// An egress allow-list entry is neither a domain, an IP address nor a
    /// CIDR range
    #[error("invalid allow-list entry {entry:?}: {reason}")]
    InvalidAllowList { entry: String, reason: String },

    /// A tool-server name is not usable as a Python module name
    #[error("invalid tool-server name {name:?}: must be a valid Python identifier")]
    InvalidServerName { name: String },

    /// Tool-server transport parameters are inconsistent
    #[error("invalid tool-server parameters: {reason}")]
    InvalidTransport { reason: String },
}
