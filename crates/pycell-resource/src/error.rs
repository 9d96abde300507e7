//! Error types for the host-side resource client

use std::path::PathBuf;

use thiserror::Error;

use crate::archive::ArchiveError;

/// Result alias for resource-client operations
pub type Result<T> = std::result::Result<T, ResourceError>;

/// Errors raised by the resource client
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The resource server did not become reachable
    #[error("failed to connect to resource server at {url}: {reason}")]
    Connect { url: String, reason: String },

    /// Transport-level request failure; retried with bounded backoff for
    /// idempotent operations
    #[error("resource request {op} failed: {reason}")]
    Request { op: &'static str, reason: String },

    /// The server answered with a non-success status
    #[error("resource request {op} returned HTTP {status}: {message}")]
    Http {
        op: &'static str,
        status: u16,
        message: String,
    },

    /// The requested path, module or server name does not exist
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The module exists but has no pure-Python source
    #[error("module {module} is not pure Python")]
    NotPurePython { module: String },

    /// Local or transferred archive handling failed
    #[error(transparent)]
    Archive(#[from] ArchiveError),

    /// Local filesystem failure
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
