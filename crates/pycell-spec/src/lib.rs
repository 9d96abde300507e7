//! Specification types for pycell sandboxes
//!
//! This crate defines the descriptor types shared between the host-side
//! orchestration crates and the in-container services: the sandbox container
//! descriptor, bind mounts, image pull policy, and tool-server transport
//! parameters, together with their validation rules.

mod error;
mod types;
mod validate;

pub use error::*;
pub use types::*;
pub use validate::*;

/// Fixed working directory inside a sandbox container. Bind-mount targets
/// and generated tool clients live under this directory.
pub const WORK_DIR: &str = "/app";

/// Package namespace (relative to [`WORK_DIR`]) under which generated
/// tool-client modules are placed. It is on the kernel's Python path, so a
/// server named `weather` is importable as `mcpgen.weather`.
pub const TOOLS_NAMESPACE: &str = "mcpgen";

/// Container-internal port of the kernel gateway.
pub const EXECUTOR_PORT: u16 = 8888;

/// Container-internal port of the resource service.
pub const RESOURCE_PORT: u16 = 8900;

/// Default sandbox image reference.
pub const DEFAULT_IMAGE: &str = "gradion-ai/pycell";

/// Absolute path of the tool-call runner binary inside the sandbox image.
/// Generated tool clients delegate to this binary at call time.
pub const TOOL_RUNNER_PATH: &str = "/usr/local/bin/pycell-toolcall";

/// Absolute path of the egress firewall script inside the sandbox image.
pub const FIREWALL_SCRIPT_PATH: &str = "/usr/local/bin/pycell-firewall";
