//! One-shot tool invocation runner
//!
//! Reads a single JSON request on stdin, performs exactly one tool call
//! against the configured server, and writes the result as JSON on stdout.
//! Generated tool-client modules delegate to this binary at call time.
//!
//! Request shape:
//! `{"server": <server params>, "tool": "name", "arguments": {...},
//!   "timeout_secs": 60}`

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pycell_mcp::ToolSession;
use pycell_spec::ToolServerParams;
use serde::Deserialize;
use tokio::io::AsyncReadExt;

#[derive(Debug, Parser)]
#[command(name = "pycell-toolcall", about = "Invoke one tool on a tool server")]
struct Args {
    /// Per-call timeout when the request does not carry one
    #[arg(long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ToolCallRequest {
    server: ToolServerParams,
    tool: String,
    #[serde(default)]
    arguments: serde_json::Value,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read request from stdin")?;
    let request: ToolCallRequest =
        serde_json::from_str(&input).context("malformed tool-call request")?;

    let timeout = Duration::from_secs(request.timeout_secs.unwrap_or(args.timeout_secs));
    let arguments = match request.arguments {
        serde_json::Value::Null => serde_json::json!({}),
        other => other,
    };

    let mut session = ToolSession::connect_with(&request.server, timeout).await?;
    let result = session.call_tool(&request.tool, arguments).await;
    session.close().await;

    let text = result?;
    println!("{}", serde_json::json!({ "result": text }));
    Ok(())
}
