//! Execution handles, output buffering and result aggregation

use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::{RoutedEvent, SessionInner};
use crate::error::{ExecutionFailure, KernelError, Result};
use crate::messages::KernelEvent;

/// Drain window after an interrupt before a timed-out execution is failed
const GRACE_PERIOD: Duration = Duration::from_secs(2);

/// A decoded raster image emitted by an execution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageData {
    /// MIME type, e.g. `image/png`
    pub mime: String,
    /// Decoded image bytes
    pub data: Vec<u8>,
}

/// Lifecycle state of one execution. Buffers are frozen once terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Submitted, no output observed yet
    Pending,
    /// Output observed, idle marker not yet seen
    Running,
    /// Idle marker seen, no kernel exception
    Completed,
    /// Kernel exception or lost connection
    Failed,
    /// Deadline elapsed; kernel was interrupted
    TimedOut,
}

impl ExecutionState {
    /// Whether the state is terminal
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// Aggregated snapshot of one completed execution.
///
/// `text` is the ordered concatenation of streamed chunks, `None` when the
/// execution produced no output. Kernel-reported exceptions are carried in
/// `error` rather than raised; use [`into_result`](Self::into_result) for
/// raise-on-error semantics.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Concatenated output text
    pub text: Option<String>,
    /// Images in arrival order
    pub images: Vec<ImageData>,
    /// Kernel-reported exception, if any
    pub error: Option<ExecutionFailure>,
}

impl ExecutionResult {
    /// Convert a kernel-reported exception into [`KernelError::Execution`]
    pub fn into_result(self) -> Result<Self> {
        match self.error {
            Some(failure) => Err(KernelError::Execution(failure)),
            None => Ok(self),
        }
    }
}

/// One submitted code unit and its accumulating output.
///
/// Obtained from [`ExecutionClient::submit`](crate::ExecutionClient::submit).
/// Output can be consumed incrementally with [`stream`](Self::stream) and
/// aggregated with [`result`](Self::result).
pub struct Execution {
    id: String,
    inner: Arc<SessionInner>,
    events: mpsc::UnboundedReceiver<RoutedEvent>,
    chunks: Vec<String>,
    images: Vec<ImageData>,
    error: Option<ExecutionFailure>,
    state: ExecutionState,
}

impl Execution {
    pub(crate) fn new(
        id: String,
        events: mpsc::UnboundedReceiver<RoutedEvent>,
        inner: Arc<SessionInner>,
    ) -> Self {
        Self {
            id,
            inner,
            events,
            chunks: Vec::new(),
            images: Vec::new(),
            error: None,
            state: ExecutionState::Pending,
        }
    }

    /// Client-chosen execution identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current execution state
    pub fn state(&self) -> ExecutionState {
        self.state
    }

    /// Yield output chunks as they arrive, until the idle marker.
    ///
    /// If the idle marker is not seen before `timeout`, the kernel is
    /// interrupted once, the channel is drained for a short grace period,
    /// and the stream ends with [`KernelError::Timeout`]. Partial output is
    /// retained; a subsequent [`result`](Self::result) call returns the
    /// aggregated snapshot.
    pub fn stream(&mut self, timeout: Duration) -> impl Stream<Item = Result<String>> + '_ {
        let deadline = Instant::now() + timeout;
        async_stream::try_stream! {
            while !self.state.is_terminal() {
                match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(Some(event)) => {
                        if let Some(chunk) = self.apply(event)? {
                            yield chunk;
                        }
                    }
                    Ok(None) => {
                        self.state = ExecutionState::Failed;
                        Err(KernelError::ConnectionLost {
                            reason: "event channel closed".to_string(),
                        })?;
                    }
                    Err(_) => {
                        Err(self.fail_timeout(timeout).await)?;
                    }
                }
            }
        }
    }

    /// Block until the execution terminates and return the aggregated
    /// snapshot.
    ///
    /// If the execution is already terminal (e.g. after a consumed
    /// [`stream`](Self::stream)), the snapshot is returned immediately.
    pub async fn result(mut self, timeout: Duration) -> Result<ExecutionResult> {
        if !self.state.is_terminal() {
            let deadline = Instant::now() + timeout;
            while !self.state.is_terminal() {
                match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(Some(event)) => {
                        self.apply(event)?;
                    }
                    Ok(None) => {
                        self.state = ExecutionState::Failed;
                        return Err(KernelError::ConnectionLost {
                            reason: "event channel closed".to_string(),
                        });
                    }
                    Err(_) => return Err(self.fail_timeout(timeout).await),
                }
            }
        }
        Ok(self.snapshot())
    }

    /// Apply one routed event to the buffers; returns the chunk to yield
    fn apply(&mut self, event: RoutedEvent) -> Result<Option<String>> {
        match event {
            RoutedEvent::Event(KernelEvent::Chunk(text)) => {
                self.state = ExecutionState::Running;
                self.chunks.push(text.clone());
                Ok(Some(text))
            }
            RoutedEvent::Event(KernelEvent::Image(image)) => {
                self.state = ExecutionState::Running;
                self.images.push(image);
                Ok(None)
            }
            RoutedEvent::Event(KernelEvent::Error(failure)) => {
                self.state = ExecutionState::Running;
                self.error = Some(failure);
                Ok(None)
            }
            RoutedEvent::Event(KernelEvent::Idle) => {
                self.state = if self.error.is_some() {
                    ExecutionState::Failed
                } else {
                    ExecutionState::Completed
                };
                Ok(None)
            }
            RoutedEvent::ConnectionLost(reason) => {
                self.state = ExecutionState::Failed;
                Err(KernelError::ConnectionLost { reason })
            }
        }
    }

    /// Interrupt the kernel, drain for a grace period, and mark the
    /// execution timed out. Partial buffers are retained.
    async fn fail_timeout(&mut self, timeout: Duration) -> KernelError {
        tracing::warn!(execution = %self.id, "execution deadline elapsed, interrupting kernel");
        if let Err(e) = self.inner.interrupt().await {
            tracing::warn!(execution = %self.id, error = %e, "kernel interrupt failed");
        }

        let grace = Instant::now() + GRACE_PERIOD;
        while !self.state.is_terminal() {
            match tokio::time::timeout_at(grace, self.events.recv()).await {
                Ok(Some(event)) => {
                    if self.apply(event).is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        self.state = ExecutionState::TimedOut;
        KernelError::Timeout { timeout }
    }

    fn snapshot(&self) -> ExecutionResult {
        ExecutionResult {
            text: if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.concat())
            },
            images: self.images.clone(),
            error: self.error.clone(),
        }
    }
}
