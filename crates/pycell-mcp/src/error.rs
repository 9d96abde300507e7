//! Error types for tool-server sessions and client generation

use std::time::Duration;

use thiserror::Error;

/// Result alias for tool-server operations
pub type Result<T> = std::result::Result<T, ToolError>;

/// Errors raised by the tool-client runtime and generator.
///
/// Transport, protocol-framing and tool-reported failures are distinct
/// kinds, so callers can tell a dead server from a misbehaving one from a
/// tool that ran and failed.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Invalid tool-server configuration
    #[error("invalid tool-server configuration: {0}")]
    Config(#[from] pycell_spec::SpecError),

    /// A stdio server subprocess could not be launched
    #[error("failed to launch tool server {command:?}: {reason}")]
    Spawn { command: String, reason: String },

    /// The transport failed mid-conversation
    #[error("tool-server transport failed: {reason}")]
    Transport { reason: String },

    /// A frame could not be interpreted as JSON-RPC, or the conversation
    /// violated the protocol
    #[error("tool-server protocol error: {reason}")]
    Protocol { reason: String },

    /// The server answered with a JSON-RPC error object
    #[error("tool server returned error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The tool ran and reported failure
    #[error("tool {name:?} failed: {message}")]
    ToolFailed { name: String, message: String },

    /// The per-call deadline elapsed
    #[error("tool call timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// A tool's input schema cannot be expressed as a typed parameter
    /// record
    #[error("tool {tool:?} has an unsupported schema: {reason}")]
    UnsupportedSchema { tool: String, reason: String },

    /// Writing generated client modules failed
    #[error("failed to write generated tool clients: {reason}")]
    Write { reason: String },
}
