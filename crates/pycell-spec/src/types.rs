//! Sandbox and tool-server descriptor types

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// When to pull the sandbox image before starting a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullPolicy {
    /// Always pull, even if the image is present locally
    Always,
    /// Pull only when the image is absent locally (default)
    #[default]
    IfNotPresent,
    /// Never pull; fail if the image is absent
    Never,
}

/// A host-directory-to-container-directory mapping.
///
/// The host path must be absolute; the container path is relative to the
/// sandbox working directory (`/app`), so `workspace` maps to
/// `/app/workspace` inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    /// Absolute path on the host
    pub host: PathBuf,
    /// Path relative to the container working directory
    pub container: String,
}

/// Descriptor of one sandbox container.
///
/// Construction is builder-style; `SandboxSpec::new(image)` yields a spec
/// with host-allocated ports, no binds and no environment:
///
/// ```
/// use pycell_spec::SandboxSpec;
///
/// let spec = SandboxSpec::new("gradion-ai/pycell")
///     .bind("/tmp/work", "workspace")
///     .env("TEST_VAR", "test_val");
/// assert!(spec.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Image reference (`name`, `name:tag` or `name@digest`)
    pub image: String,
    /// Pull policy applied before the container is created
    #[serde(default)]
    pub pull_policy: PullPolicy,
    /// Fixed host port for the kernel gateway; `None` allocates an ephemeral
    /// port at start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor_port: Option<u16>,
    /// Fixed host port for the resource service; `None` allocates an
    /// ephemeral port at start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_port: Option<u16>,
    /// Bind mounts, host-absolute to container-relative
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub binds: Vec<BindMount>,
    /// Environment variables injected into the container
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

impl SandboxSpec {
    /// Create a spec for the given image with defaults for everything else
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            pull_policy: PullPolicy::default(),
            executor_port: None,
            resource_port: None,
            binds: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Set the pull policy
    #[must_use]
    pub fn pull_policy(mut self, policy: PullPolicy) -> Self {
        self.pull_policy = policy;
        self
    }

    /// Fix the host port mapped to the kernel gateway
    #[must_use]
    pub fn executor_port(mut self, port: u16) -> Self {
        self.executor_port = Some(port);
        self
    }

    /// Fix the host port mapped to the resource service
    #[must_use]
    pub fn resource_port(mut self, port: u16) -> Self {
        self.resource_port = Some(port);
        self
    }

    /// Add a bind mount from an absolute host path to a path relative to
    /// the container working directory
    #[must_use]
    pub fn bind(mut self, host: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        self.binds.push(BindMount {
            host: host.into(),
            container: container.into(),
        });
        self
    }

    /// Add an environment variable
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self::new(crate::DEFAULT_IMAGE)
    }
}

/// Remote tool-server transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTransport {
    /// Streamable HTTP: JSON-RPC over POST, responses as JSON or an SSE
    /// stream on the same request
    StreamableHttp,
    /// Legacy server-sent-events transport with a separate POST endpoint
    Sse,
}

/// Parameters of a stdio tool server, launched as a subprocess
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioServerParams {
    /// Command to launch
    pub command: String,
    /// Command arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Extra environment variables for the server process
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
}

/// Parameters of a remote tool server reached over HTTP
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteServerParams {
    /// Transport kind
    #[serde(rename = "type")]
    pub transport: RemoteTransport,
    /// Server URL
    pub url: String,
}

/// Configuration of one tool server.
///
/// The wire shape distinguishes transports the way generated client packages
/// store them: stdio servers carry a `command` key, remote servers carry a
/// `type` and a `url` key:
///
/// ```
/// use pycell_spec::ToolServerParams;
///
/// let stdio: ToolServerParams =
///     serde_json::from_str(r#"{"command": "python", "args": ["server.py"]}"#).unwrap();
/// assert!(matches!(stdio, ToolServerParams::Stdio(_)));
///
/// let sse: ToolServerParams =
///     serde_json::from_str(r#"{"type": "sse", "url": "http://tools.local/sse"}"#).unwrap();
/// assert!(matches!(sse, ToolServerParams::Remote(_)));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolServerParams {
    /// Subprocess server speaking newline-delimited JSON-RPC on stdio
    Stdio(StdioServerParams),
    /// Remote server reached over streamable HTTP or SSE
    Remote(RemoteServerParams),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = SandboxSpec::new("test:latest")
            .executor_port(9000)
            .bind("/tmp/ws", "workspace")
            .env("A", "1");
        assert_eq!(spec.image, "test:latest");
        assert_eq!(spec.executor_port, Some(9000));
        assert_eq!(spec.resource_port, None);
        assert_eq!(spec.binds.len(), 1);
        assert_eq!(spec.env.get("A").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_pull_policy_serde() {
        assert_eq!(
            serde_json::to_string(&PullPolicy::IfNotPresent).unwrap(),
            "\"if_not_present\""
        );
        let p: PullPolicy = serde_json::from_str("\"never\"").unwrap();
        assert_eq!(p, PullPolicy::Never);
    }

    #[test]
    fn test_tool_server_params_stdio_shape() {
        let json = r#"{"command": "python", "args": ["workspace/server.py"], "env": {"K": "v"}}"#;
        let params: ToolServerParams = serde_json::from_str(json).unwrap();
        match params {
            ToolServerParams::Stdio(p) => {
                assert_eq!(p.command, "python");
                assert_eq!(p.args, vec!["workspace/server.py"]);
                assert_eq!(p.env.get("K").map(String::as_str), Some("v"));
            }
            other => panic!("expected stdio params, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_server_params_remote_shape() {
        let json = r#"{"type": "streamable_http", "url": "http://10.0.0.5:8000/mcp"}"#;
        let params: ToolServerParams = serde_json::from_str(json).unwrap();
        match params {
            ToolServerParams::Remote(p) => {
                assert_eq!(p.transport, RemoteTransport::StreamableHttp);
                assert_eq!(p.url, "http://10.0.0.5:8000/mcp");
            }
            other => panic!("expected remote params, got {other:?}"),
        }
    }

    #[test]
    fn test_tool_server_params_unknown_transport_rejected() {
        let json = r#"{"type": "websocket", "url": "ws://tools.local"}"#;
        assert!(serde_json::from_str::<ToolServerParams>(json).is_err());
    }

    #[test]
    fn test_tool_server_params_roundtrip() {
        let params = ToolServerParams::Remote(RemoteServerParams {
            transport: RemoteTransport::Sse,
            url: "http://tools.local/sse".to_string(),
        });
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"sse\""));
        let back: ToolServerParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back, params);
    }
}
