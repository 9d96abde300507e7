//! MCP tool-server client runtime and tool-client generation
//!
//! A [`ToolSession`] speaks JSON-RPC to one MCP tool server over one of
//! three transports (stdio subprocess, streamable HTTP, legacy SSE) and
//! converges them on a single conversation: initialize, list tools, call a
//! named tool, tear down.
//!
//! [`generate_tool_clients`] turns a server's advertised tools into
//! importable Python modules inside the sandbox; calling a generated
//! function delegates back to this crate's `pycell-toolcall` binary, which
//! performs exactly one invocation against the configured server.

mod error;
mod gen;
mod session;
mod transport;
mod types;

pub use error::{Result, ToolError};
pub use gen::{generate_tool_clients, sanitize_name};
pub use session::ToolSession;
pub use types::Tool;
