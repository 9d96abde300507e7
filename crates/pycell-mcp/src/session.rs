//! Tool-server sessions
//!
//! One session per conversation: connect over the configured transport,
//! run the initialize handshake, then list tools or invoke one. Sessions
//! are short-lived by design; generated tool clients open a fresh session
//! per call.

use std::time::Duration;

use pycell_spec::ToolServerParams;
use serde_json::{json, Value};

use crate::error::{Result, ToolError};
use crate::transport::Transport;
use crate::types::{CallToolResult, JsonRpcIncoming, ListToolsResult, Tool, PROTOCOL_VERSION};

const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// An initialized session with one tool server
#[derive(Debug)]
pub struct ToolSession {
    transport: Transport,
    next_id: i64,
    call_timeout: Duration,
}

impl ToolSession {
    /// Connect and initialize with the default per-call timeout
    pub async fn connect(params: &ToolServerParams) -> Result<Self> {
        Self::connect_with(params, DEFAULT_CALL_TIMEOUT).await
    }

    /// Connect and initialize with an explicit per-call timeout
    pub async fn connect_with(params: &ToolServerParams, call_timeout: Duration) -> Result<Self> {
        params.validate()?;

        let transport = Transport::connect(params).await?;
        let mut session = Self {
            transport,
            next_id: 1,
            call_timeout,
        };

        session
            .request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "pycell",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;
        session
            .transport
            .notify("notifications/initialized", None)
            .await?;

        Ok(session)
    }

    /// Tools advertised by the server
    pub async fn list_tools(&mut self) -> Result<Vec<Tool>> {
        let result = self.request("tools/list", Some(json!({}))).await?;
        let listing: ListToolsResult =
            serde_json::from_value(result).map_err(|e| ToolError::Protocol {
                reason: format!("malformed tools/list result: {e}"),
            })?;
        Ok(listing.tools)
    }

    /// Invoke a named tool and return the concatenated text content of its
    /// result
    pub async fn call_tool(&mut self, name: &str, arguments: Value) -> Result<String> {
        let result = self
            .request(
                "tools/call",
                Some(json!({"name": name, "arguments": arguments})),
            )
            .await?;
        let call: CallToolResult =
            serde_json::from_value(result).map_err(|e| ToolError::Protocol {
                reason: format!("malformed tools/call result: {e}"),
            })?;

        let text = call
            .content
            .iter()
            .filter(|block| block.kind == "text")
            .filter_map(|block| block.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n");

        if call.is_error {
            Err(ToolError::ToolFailed {
                name: name.to_string(),
                message: text,
            })
        } else {
            Ok(text)
        }
    }

    /// Tear down the transport. Dropping the session has the same effect;
    /// this form makes the intent explicit at call sites.
    pub async fn close(self) {
        drop(self);
    }

    async fn request(&mut self, method: &str, params: Option<Value>) -> Result<Value> {
        let id = self.next_id;
        self.next_id += 1;

        let reply = tokio::time::timeout(
            self.call_timeout,
            self.transport.request(id, method, params),
        )
        .await
        .map_err(|_| ToolError::Timeout {
            timeout: self.call_timeout,
        })??;

        reply_result(reply)
    }
}

fn reply_result(reply: JsonRpcIncoming) -> Result<Value> {
    if let Some(error) = reply.error {
        return Err(ToolError::Rpc {
            code: error.code,
            message: error.message,
        });
    }
    reply.result.ok_or_else(|| ToolError::Protocol {
        reason: "response carries neither result nor error".to_string(),
    })
}
