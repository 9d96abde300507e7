//! Tool-server transports
//!
//! Three ways to reach a tool server, converging on one request/response
//! surface: a stdio subprocess speaking newline-delimited JSON-RPC, a
//! streamable-HTTP endpoint answering with JSON or an SSE stream per
//! request, and the legacy SSE transport with a separate POST endpoint.

use std::collections::HashMap;

use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use pycell_spec::{RemoteServerParams, RemoteTransport, StdioServerParams, ToolServerParams};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, ToolError};
use crate::types::{JsonRpcIncoming, JsonRpcNotification, JsonRpcRequest};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// Environment variables forwarded to stdio tool servers in addition to the
/// configured extras
#[cfg(unix)]
const INHERITED_ENV_VARS: &[&str] = &[
    "HOME", "LOGNAME", "PATH", "SHELL", "USER", "LANG", "LC_ALL", "TERM", "TMPDIR", "TZ",
];

#[cfg(windows)]
const INHERITED_ENV_VARS: &[&str] = &[
    "PATH",
    "PATHEXT",
    "USERNAME",
    "USERDOMAIN",
    "USERPROFILE",
    "TEMP",
    "TMP",
];

#[derive(Debug)]
pub(crate) enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
    Sse(SseTransport),
}

impl Transport {
    pub async fn connect(params: &ToolServerParams) -> Result<Self> {
        match params {
            ToolServerParams::Stdio(stdio) => Ok(Self::Stdio(StdioTransport::spawn(stdio)?)),
            ToolServerParams::Remote(RemoteServerParams { transport, url }) => match transport {
                RemoteTransport::StreamableHttp => Ok(Self::Http(HttpTransport::new(url)?)),
                RemoteTransport::Sse => Ok(Self::Sse(SseTransport::connect(url).await?)),
            },
        }
    }

    pub async fn request(
        &mut self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcIncoming> {
        match self {
            Self::Stdio(t) => t.request(id, method, params).await,
            Self::Http(t) => t.request(id, method, params).await,
            Self::Sse(t) => t.request(id, method, params).await,
        }
    }

    pub async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        match self {
            Self::Stdio(t) => t.notify(method, params).await,
            Self::Http(t) => t.notify(method, params).await,
            Self::Sse(t) => t.notify(method, params).await,
        }
    }
}

// ---------------------------------------------------------------------------
// stdio
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct StdioTransport {
    // Held so the server is killed when the transport is dropped
    _child: Child,
    stdin: ChildStdin,
    lines: Lines<BufReader<ChildStdout>>,
}

impl StdioTransport {
    fn spawn(params: &StdioServerParams) -> Result<Self> {
        let env: HashMap<String, String> = INHERITED_ENV_VARS
            .iter()
            .filter_map(|var| std::env::var(var).ok().map(|value| (var.to_string(), value)))
            .chain(params.env.clone())
            .collect();

        let mut child = tokio::process::Command::new(&params.command)
            .args(&params.args)
            .env_clear()
            .envs(env)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Spawn {
                command: params.command.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| ToolError::Spawn {
            command: params.command.clone(),
            reason: "failed to capture child stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| ToolError::Spawn {
            command: params.command.clone(),
            reason: "failed to capture child stdout".to_string(),
        })?;

        Ok(Self {
            _child: child,
            stdin,
            lines: BufReader::new(stdout).lines(),
        })
    }

    async fn write_line(&mut self, mut frame: String) -> Result<()> {
        frame.push('\n');
        self.stdin
            .write_all(frame.as_bytes())
            .await
            .map_err(|e| ToolError::Transport {
                reason: format!("write to tool server failed: {e}"),
            })
    }

    async fn request(
        &mut self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcIncoming> {
        let frame = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .expect("request serialization");
        self.write_line(frame).await?;

        loop {
            let line = self
                .lines
                .next_line()
                .await
                .map_err(|e| ToolError::Transport {
                    reason: format!("read from tool server failed: {e}"),
                })?
                .ok_or_else(|| ToolError::Transport {
                    reason: "tool server closed its stdout".to_string(),
                })?;

            let incoming: JsonRpcIncoming =
                serde_json::from_str(&line).map_err(|e| ToolError::Protocol {
                    reason: format!("malformed frame: {e}"),
                })?;
            if incoming.is_notification() {
                tracing::debug!(method = incoming.method.as_deref().unwrap_or(""), "server notification ignored");
                continue;
            }
            if incoming.matches_id(id) {
                return Ok(incoming);
            }
            tracing::debug!(id = ?incoming.id, "frame for another request id skipped");
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let frame = serde_json::to_string(&JsonRpcNotification::new(method, params))
            .expect("notification serialization");
        self.write_line(frame).await
    }
}

// ---------------------------------------------------------------------------
// streamable HTTP
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct HttpTransport {
    http: reqwest::Client,
    url: String,
    session_id: Option<String>,
}

impl HttpTransport {
    fn new(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;
        Ok(Self {
            http,
            url: url.to_string(),
            session_id: None,
        })
    }

    fn post(&self, body: &impl serde::Serialize) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&self.url)
            .header(reqwest::header::ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(session_id) = &self.session_id {
            request = request.header(SESSION_HEADER, session_id);
        }
        request
    }

    async fn request(
        &mut self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcIncoming> {
        let response = self
            .post(&JsonRpcRequest::new(id, method, params))
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ToolError::Transport {
                reason: format!("tool server returned HTTP {}", response.status()),
            });
        }

        // The server assigns a session on initialize; echo it afterwards
        if let Some(session_id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            self.session_id = Some(session_id.to_string());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = event.map_err(|e| ToolError::Protocol {
                    reason: format!("malformed event stream: {e}"),
                })?;
                let incoming: JsonRpcIncoming =
                    serde_json::from_str(&event.data).map_err(|e| ToolError::Protocol {
                        reason: format!("malformed frame: {e}"),
                    })?;
                if incoming.matches_id(id) {
                    return Ok(incoming);
                }
            }
            Err(ToolError::Protocol {
                reason: "event stream ended without a response".to_string(),
            })
        } else {
            response
                .json::<JsonRpcIncoming>()
                .await
                .map_err(|e| ToolError::Protocol {
                    reason: format!("malformed response body: {e}"),
                })
        }
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        let response = self
            .post(&JsonRpcNotification::new(method, params))
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ToolError::Transport {
                reason: format!("tool server returned HTTP {}", response.status()),
            })
        }
    }
}

// ---------------------------------------------------------------------------
// legacy SSE
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) struct SseTransport {
    http: reqwest::Client,
    post_url: String,
    incoming: mpsc::UnboundedReceiver<JsonRpcIncoming>,
    reader: JoinHandle<()>,
}

impl SseTransport {
    async fn connect(url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;

        let response = http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ToolError::Transport {
                reason: format!("tool server returned HTTP {}", response.status()),
            });
        }

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let reader = tokio::spawn(async move {
            let mut endpoint_tx = Some(endpoint_tx);
            let mut events = response.bytes_stream().eventsource();
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "event stream failed");
                        break;
                    }
                };
                match event.event.as_str() {
                    "endpoint" => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(event.data);
                        }
                    }
                    _ => match serde_json::from_str::<JsonRpcIncoming>(&event.data) {
                        Ok(incoming) => {
                            if incoming_tx.send(incoming).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "malformed frame on event stream");
                        }
                    },
                }
            }
        });

        // The first event names the endpoint requests are POSTed to
        let endpoint =
            tokio::time::timeout(std::time::Duration::from_secs(10), endpoint_rx)
                .await
                .map_err(|_| ToolError::Protocol {
                    reason: "no endpoint event from tool server".to_string(),
                })?
                .map_err(|_| ToolError::Transport {
                    reason: "event stream closed before the endpoint event".to_string(),
                })?;

        let base = url::Url::parse(url).map_err(|e| ToolError::Config(
            pycell_spec::SpecError::InvalidTransport {
                reason: format!("invalid server URL {url:?}: {e}"),
            },
        ))?;
        let post_url = base
            .join(&endpoint)
            .map_err(|e| ToolError::Protocol {
                reason: format!("invalid endpoint {endpoint:?}: {e}"),
            })?
            .to_string();

        Ok(Self {
            http,
            post_url,
            incoming: incoming_rx,
            reader,
        })
    }

    async fn post(&self, body: &impl serde::Serialize) -> Result<()> {
        let response = self
            .http
            .post(&self.post_url)
            .json(body)
            .send()
            .await
            .map_err(|e| ToolError::Transport {
                reason: e.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ToolError::Transport {
                reason: format!("tool server returned HTTP {}", response.status()),
            })
        }
    }

    async fn request(
        &mut self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcIncoming> {
        self.post(&JsonRpcRequest::new(id, method, params)).await?;

        while let Some(incoming) = self.incoming.recv().await {
            if incoming.is_notification() {
                continue;
            }
            if incoming.matches_id(id) {
                return Ok(incoming);
            }
        }
        Err(ToolError::Transport {
            reason: "event stream closed before a response arrived".to_string(),
        })
    }

    async fn notify(&mut self, method: &str, params: Option<Value>) -> Result<()> {
        self.post(&JsonRpcNotification::new(method, params)).await
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
