//! Kernel session management: creation, message channel, heartbeat

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::error::{KernelError, Result};
use crate::execution::{Execution, ExecutionResult};
use crate::messages::{classify, execute_request, ChannelMessage, KernelEvent};

/// Options controlling session establishment
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Kernel-creation attempts while the gateway is still coming up
    pub connect_retries: u32,
    /// Delay between kernel-creation attempts
    pub connect_retry_interval: Duration,
    /// Interval of the gateway liveness heartbeat
    pub heartbeat_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_retries: 10,
            connect_retry_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

/// Connection state of a session. `Disconnected` is terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Channel open, heartbeat passing
    Connected,
    /// Channel or heartbeat failed; pending executions have been failed
    Disconnected { reason: String },
}

/// Event routed to one execution's buffer
#[derive(Debug, Clone)]
pub(crate) enum RoutedEvent {
    Event(KernelEvent),
    ConnectionLost(String),
}

pub(crate) enum WriterCmd {
    Send(String),
    Close,
}

#[derive(Debug, Deserialize)]
struct KernelInfo {
    id: String,
}

pub(crate) struct SessionInner {
    http: reqwest::Client,
    base_url: String,
    kernel_id: String,
    outgoing: mpsc::Sender<WriterCmd>,
    routes: Mutex<HashMap<String, mpsc::UnboundedSender<RoutedEvent>>>,
    state: Mutex<SessionState>,
}

impl SessionInner {
    pub(crate) fn state(&self) -> SessionState {
        self.state.lock().clone()
    }

    /// Transition to `Disconnected` and fail all pending executions.
    /// Later transitions keep the first reason.
    fn fail_all(&self, reason: &str) {
        {
            let mut state = self.state.lock();
            if matches!(*state, SessionState::Disconnected { .. }) {
                return;
            }
            *state = SessionState::Disconnected {
                reason: reason.to_string(),
            };
        }
        tracing::warn!(kernel = %self.kernel_id, reason = %reason, "session disconnected");
        let routes: Vec<_> = self.routes.lock().drain().collect();
        for (_, tx) in routes {
            let _ = tx.send(RoutedEvent::ConnectionLost(reason.to_string()));
        }
    }

    /// Send an out-of-band interrupt to the kernel
    pub(crate) async fn interrupt(&self) -> Result<()> {
        let url = format!(
            "{}/api/kernels/{}/interrupt",
            self.base_url, self.kernel_id
        );
        let response = self
            .http
            .post(&url)
            .send()
            .await
            .map_err(|e| KernelError::Interrupt {
                reason: e.to_string(),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(KernelError::Interrupt {
                reason: format!("gateway returned {}", response.status()),
            })
        }
    }
}

/// A stateful execution session bound to exactly one kernel.
///
/// Created with [`connect`](ExecutionClient::connect); must be released with
/// [`close`](ExecutionClient::close), which deletes the kernel. Executions
/// submitted on the same client observe each other's side effects in
/// submission order.
pub struct ExecutionClient {
    inner: Arc<SessionInner>,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl ExecutionClient {
    /// Connect to the kernel gateway on `host:port` with default options
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        Self::connect_with(host, port, ConnectOptions::default()).await
    }

    /// Connect with explicit options: create a kernel, open its message
    /// channel and start the heartbeat
    pub async fn connect_with(host: &str, port: u16, options: ConnectOptions) -> Result<Self> {
        let base_url = format!("http://{host}:{port}");
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| KernelError::KernelCreate {
                url: base_url.clone(),
                reason: e.to_string(),
            })?;

        let kernel_id = create_kernel(&http, &base_url, &options).await?;
        tracing::info!(kernel = %kernel_id, gateway = %base_url, "kernel created");

        let ws_url = format!("ws://{host}:{port}/api/kernels/{kernel_id}/channels");
        let (ws_stream, _) =
            connect_async(ws_url.as_str())
                .await
                .map_err(|e| KernelError::ChannelConnect {
                    url: ws_url.clone(),
                    reason: e.to_string(),
                })?;
        let (mut ws_sink, mut ws_source) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::channel::<WriterCmd>(64);

        let inner = Arc::new(SessionInner {
            http,
            base_url,
            kernel_id,
            outgoing,
            routes: Mutex::new(HashMap::new()),
            state: Mutex::new(SessionState::Connected),
        });

        // Writer task: sole producer on the channel sink
        let writer = tokio::spawn(async move {
            while let Some(cmd) = outgoing_rx.recv().await {
                match cmd {
                    WriterCmd::Send(frame) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(frame.into())).await {
                            tracing::warn!(error = %e, "channel write failed");
                            break;
                        }
                    }
                    WriterCmd::Close => {
                        let _ = ws_sink.send(WsMessage::Close(None)).await;
                        break;
                    }
                }
            }
        });

        // Reader task: demultiplexes messages to per-execution buffers by
        // parent header id
        let reader = {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                loop {
                    match ws_source.next().await {
                        Some(Ok(WsMessage::Text(raw))) => {
                            let msg: ChannelMessage = match serde_json::from_str(raw.as_str()) {
                                Ok(msg) => msg,
                                Err(e) => {
                                    tracing::warn!(error = %e, "malformed gateway message");
                                    continue;
                                }
                            };
                            route_message(&inner, msg);
                        }
                        Some(Ok(WsMessage::Close(_))) | None => {
                            inner.fail_all("kernel channel closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            inner.fail_all(&format!("kernel channel error: {e}"));
                            break;
                        }
                    }
                }
            })
        };

        // Heartbeat task: probes gateway liveness; a failed probe is terminal
        let heartbeat = {
            let inner = Arc::clone(&inner);
            let interval = options.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    let url = format!("{}/api/kernels/{}", inner.base_url, inner.kernel_id);
                    match inner.http.get(&url).send().await {
                        Ok(response) if response.status().is_success() => {}
                        Ok(response) => {
                            inner.fail_all(&format!(
                                "gateway heartbeat returned {}",
                                response.status()
                            ));
                            break;
                        }
                        Err(e) => {
                            inner.fail_all(&format!("gateway heartbeat failed: {e}"));
                            break;
                        }
                    }
                }
            })
        };

        Ok(Self {
            inner,
            tasks: vec![writer, reader, heartbeat],
            closed: false,
        })
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    /// Submit code and return a handle whose output can be streamed
    pub async fn submit(&self, code: &str) -> Result<Execution> {
        if let SessionState::Disconnected { reason } = self.inner.state() {
            return Err(KernelError::ConnectionLost { reason });
        }

        let execution_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .routes
            .lock()
            .insert(execution_id.clone(), tx);

        let frame = execute_request(&execution_id, code);
        if self
            .inner
            .outgoing
            .send(WriterCmd::Send(frame))
            .await
            .is_err()
        {
            self.inner.routes.lock().remove(&execution_id);
            return Err(KernelError::ConnectionLost {
                reason: "channel writer stopped".to_string(),
            });
        }

        tracing::debug!(execution = %execution_id, "execution submitted");
        Ok(Execution::new(execution_id, rx, Arc::clone(&self.inner)))
    }

    /// Submit code and block until the execution completes or times out.
    /// Equivalent to [`submit`](Self::submit) followed by draining the
    /// result.
    pub async fn execute(&self, code: &str, timeout: Duration) -> Result<ExecutionResult> {
        let execution = self.submit(code).await?;
        execution.result(timeout).await
    }

    /// Send an out-of-band interrupt to the kernel
    pub async fn interrupt(&self) -> Result<()> {
        self.inner.interrupt().await
    }

    /// Delete the kernel and close the message channel. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let _ = self.inner.outgoing.send(WriterCmd::Close).await;

        let url = format!("{}/api/kernels/{}", self.inner.base_url, self.inner.kernel_id);
        let result = self.inner.http.delete(&url).send().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.inner.fail_all("session closed");

        match result {
            Ok(response)
                if response.status().is_success()
                    || response.status() == reqwest::StatusCode::NOT_FOUND =>
            {
                tracing::info!(kernel = %self.inner.kernel_id, "kernel deleted");
                Ok(())
            }
            Ok(response) => Err(KernelError::Shutdown {
                reason: format!("gateway returned {}", response.status()),
            }),
            Err(e) => Err(KernelError::Shutdown {
                reason: e.to_string(),
            }),
        }
    }

    /// Kernel identifier issued by the gateway
    pub fn kernel_id(&self) -> &str {
        &self.inner.kernel_id
    }
}

impl Drop for ExecutionClient {
    fn drop(&mut self) {
        // Local cleanup only; kernel deletion needs an explicit close()
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn route_message(inner: &Arc<SessionInner>, msg: ChannelMessage) {
    let Some(parent_id) = msg.parent_header.id.clone() else {
        tracing::trace!(kind = %msg.header.kind, "unparented message dropped");
        return;
    };

    let mut routes = inner.routes.lock();
    if !routes.contains_key(&parent_id) {
        tracing::debug!(
            kind = %msg.header.kind,
            parent = %parent_id,
            "message for unknown execution dropped"
        );
        return;
    }

    match classify(&msg) {
        Some(event) => {
            let terminal = matches!(event, KernelEvent::Idle);
            if let Some(tx) = routes.get(&parent_id) {
                let _ = tx.send(RoutedEvent::Event(event));
            }
            if terminal {
                routes.remove(&parent_id);
            }
        }
        None => {
            tracing::debug!(
                kind = %msg.header.kind,
                parent = %parent_id,
                "ignoring message type"
            );
        }
    }
}

async fn create_kernel(
    http: &reqwest::Client,
    base_url: &str,
    options: &ConnectOptions,
) -> Result<String> {
    let url = format!("{base_url}/api/kernels");
    let mut last_reason = String::new();

    for attempt in 0..options.connect_retries.max(1) {
        if attempt > 0 {
            tokio::time::sleep(options.connect_retry_interval).await;
        }
        match http.post(&url).json(&serde_json::json!({})).send().await {
            Ok(response) if response.status().is_success() => {
                let info: KernelInfo =
                    response.json().await.map_err(|e| KernelError::Protocol {
                        reason: format!("invalid kernel-creation response: {e}"),
                    })?;
                return Ok(info.id);
            }
            Ok(response) => {
                last_reason = format!("gateway returned {}", response.status());
            }
            Err(e) => {
                last_reason = e.to_string();
            }
        }
        tracing::debug!(attempt = attempt + 1, reason = %last_reason, "kernel creation retry");
    }

    Err(KernelError::KernelCreate {
        url,
        reason: last_reason,
    })
}
