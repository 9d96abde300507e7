//! Streaming, stateful execution client for the pycell kernel gateway
//!
//! An [`ExecutionClient`] binds one kernel on one sandbox container: it
//! creates the kernel over HTTP, opens the kernel's bidirectional message
//! channel, and demultiplexes streamed output to per-execution buffers.
//! Executions on the same client share kernel state; executions on
//! different clients do not share in-memory state.
//!
//! ```no_run
//! use std::time::Duration;
//! use pycell_kernel::ExecutionClient;
//!
//! # async fn example() -> Result<(), pycell_kernel::KernelError> {
//! let mut client = ExecutionClient::connect("localhost", 8888).await?;
//! let result = client
//!     .execute("print('Hello, world!')", Duration::from_secs(120))
//!     .await?;
//! assert_eq!(result.text.as_deref(), Some("Hello, world!\n"));
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod execution;
mod messages;

pub use client::{ConnectOptions, ExecutionClient, SessionState};
pub use error::{ExecutionFailure, KernelError, Result};
pub use execution::{Execution, ExecutionResult, ExecutionState, ImageData};
