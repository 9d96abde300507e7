//! Error types for the execution client

use std::time::Duration;

use thiserror::Error;

/// Result alias for execution-client operations
pub type Result<T> = std::result::Result<T, KernelError>;

/// An exception reported by the kernel for one execution.
///
/// Carried in the execution result; only raised when the caller opts into
/// raise-on-error semantics via `ExecutionResult::into_result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    /// Exception type name, e.g. `ZeroDivisionError`
    pub name: String,
    /// Exception value/message
    pub value: String,
    /// Traceback text, ANSI escapes stripped
    pub trace: String,
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.name, self.value)
    }
}

/// Errors raised by the execution client
#[derive(Debug, Error)]
pub enum KernelError {
    /// Kernel creation at the gateway failed
    #[error("failed to create kernel at {url}: {reason}")]
    KernelCreate { url: String, reason: String },

    /// Opening the kernel message channel failed
    #[error("failed to open kernel channel at {url}: {reason}")]
    ChannelConnect { url: String, reason: String },

    /// The session lost its connection to the gateway; the session is
    /// terminal and pending executions fail with this error
    #[error("connection to kernel gateway lost: {reason}")]
    ConnectionLost { reason: String },

    /// A gateway message could not be interpreted
    #[error("malformed gateway message: {reason}")]
    Protocol { reason: String },

    /// The execution did not reach its idle marker before the deadline; an
    /// interrupt was issued and partial output is retained on the execution
    #[error("execution timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    /// The out-of-band kernel interrupt failed
    #[error("kernel interrupt failed: {reason}")]
    Interrupt { reason: String },

    /// Kernel deletion on close failed
    #[error("kernel shutdown failed: {reason}")]
    Shutdown { reason: String },

    /// The kernel reported an exception for this execution
    #[error("execution failed: {0}")]
    Execution(ExecutionFailure),
}
