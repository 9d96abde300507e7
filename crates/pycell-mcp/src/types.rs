//! Minimal JSON-RPC and MCP payload types
//!
//! Only the slice of the protocol the runtime needs: requests,
//! notifications, a permissive incoming frame, and the tool-listing and
//! tool-call result shapes. Unknown fields are ignored throughout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub(crate) const JSONRPC_VERSION: &str = "2.0";
pub(crate) const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: i64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: i64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// One incoming frame: response, error or server-initiated notification
#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcIncoming {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JsonRpcErrorObject>,
    #[serde(default)]
    pub method: Option<String>,
}

impl JsonRpcIncoming {
    /// Whether this frame answers the request with the given id. Servers
    /// may echo integer ids back as strings.
    pub fn matches_id(&self, id: i64) -> bool {
        match &self.id {
            Some(Value::Number(n)) => n.as_i64() == Some(id),
            Some(Value::String(s)) => s.parse::<i64>().ok() == Some(id),
            _ => false,
        }
    }

    /// Whether this frame is a server-initiated notification
    pub fn is_notification(&self) -> bool {
        self.id.is_none() && self.method.is_some()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// One tool advertised by a tool server
#[derive(Debug, Clone, Deserialize)]
pub struct Tool {
    /// Tool name as advertised (not sanitized)
    pub name: String,
    /// Human-readable description, used as the generated docstring
    #[serde(default)]
    pub description: Option<String>,
    /// JSON Schema of the tool's input
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<Tool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ContentBlock {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = JsonRpcRequest::new(7, "tools/list", None);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["jsonrpc"], "2.0");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "tools/list");
        assert!(json.get("params").is_none());
    }

    #[test]
    fn test_incoming_id_matching() {
        let numeric: JsonRpcIncoming =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "id": 3, "result": {}}"#).unwrap();
        assert!(numeric.matches_id(3));
        assert!(!numeric.matches_id(4));

        let stringy: JsonRpcIncoming =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "id": "3", "result": {}}"#).unwrap();
        assert!(stringy.matches_id(3));

        let notification: JsonRpcIncoming =
            serde_json::from_str(r#"{"jsonrpc": "2.0", "method": "notifications/progress"}"#)
                .unwrap();
        assert!(notification.is_notification());
        assert!(!notification.matches_id(3));
    }

    #[test]
    fn test_call_tool_result_shape() {
        let result: CallToolResult = serde_json::from_str(
            r#"{"content": [{"type": "text", "text": "ok"}, {"type": "audio"}], "isError": false}"#,
        )
        .unwrap();
        assert_eq!(result.content.len(), 2);
        assert_eq!(result.content[0].text.as_deref(), Some("ok"));
        assert!(!result.is_error);
    }

    #[test]
    fn test_tool_shape() {
        let tool: Tool = serde_json::from_str(
            r#"{"name": "tool-1", "description": "Echo.",
                "inputSchema": {"type": "object", "properties": {"s": {"type": "string"}}}}"#,
        )
        .unwrap();
        assert_eq!(tool.name, "tool-1");
        assert_eq!(tool.input_schema["type"], "object");
    }
}
