//! Execution-client protocol tests against an in-process fake gateway
//!
//! The fake implements the gateway surface the client depends on: kernel
//! CRUD over HTTP and a WebSocket channel speaking
//! `{header, parent_header, content}` frames. Submitted "code" is a small
//! command language, so the tests exercise streaming, demultiplexing,
//! interrupts and state without a real kernel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use base64::Engine;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;

use pycell_kernel::{ExecutionClient, ExecutionState, KernelError, SessionState};

const FAKE_PNG: &[u8] = b"not-really-a-png";

#[derive(Clone, Default)]
struct GatewayState {
    kernels: Arc<Mutex<HashMap<String, broadcast::Sender<()>>>>,
    deleted: Arc<Mutex<Vec<String>>>,
    interrupted: Arc<Mutex<Vec<String>>>,
}

fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/api/kernels", post(create_kernel))
        .route("/api/kernels/{id}", get(kernel_info).delete(delete_kernel))
        .route("/api/kernels/{id}/interrupt", post(interrupt_kernel))
        .route("/api/kernels/{id}/channels", any(channels))
        .with_state(state)
}

async fn create_kernel(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    let id = uuid::Uuid::new_v4().simple().to_string();
    let (tx, _) = broadcast::channel(8);
    state.kernels.lock().unwrap().insert(id.clone(), tx);
    Json(serde_json::json!({"id": id}))
}

async fn kernel_info(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    if state.kernels.lock().unwrap().contains_key(&id) {
        Json(serde_json::json!({"id": id})).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn delete_kernel(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    state.kernels.lock().unwrap().remove(&id);
    state.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT.into_response()
}

async fn interrupt_kernel(State(state): State<GatewayState>, Path(id): Path<String>) -> Response {
    state.interrupted.lock().unwrap().push(id.clone());
    if let Some(tx) = state.kernels.lock().unwrap().get(&id) {
        let _ = tx.send(());
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn channels(
    State(state): State<GatewayState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    let interrupts = state.kernels.lock().unwrap().get(&id).cloned();
    match interrupts {
        Some(tx) => ws.on_upgrade(move |socket| kernel_session(socket, tx)),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

type SharedSink = Arc<tokio::sync::Mutex<SplitSink<WebSocket, Message>>>;

async fn kernel_session(socket: WebSocket, interrupts: broadcast::Sender<()>) {
    let (sink, mut source) = socket.split();
    let sink: SharedSink = Arc::new(tokio::sync::Mutex::new(sink));
    let vars: Arc<Mutex<HashMap<String, String>>> = Arc::default();

    while let Some(Ok(msg)) = source.next().await {
        let Message::Text(raw) = msg else { continue };
        let request: serde_json::Value = serde_json::from_str(raw.as_str()).unwrap();
        let execution_id = request["header"]["id"].as_str().unwrap().to_string();
        let code = request["content"]["code"].as_str().unwrap().to_string();

        if code == "die" {
            // Simulate a gateway-side connection loss
            return;
        }

        let sink = Arc::clone(&sink);
        let vars = Arc::clone(&vars);
        let interrupt_rx = interrupts.subscribe();
        tokio::spawn(run_code(sink, vars, interrupt_rx, execution_id, code));
    }
}

async fn emit(sink: &SharedSink, parent: &str, kind: &str, content: serde_json::Value) {
    let frame = serde_json::json!({
        "header": {"id": uuid::Uuid::new_v4().simple().to_string(), "type": kind},
        "parent_header": {"id": parent},
        "content": content,
    });
    let _ = sink
        .lock()
        .await
        .send(Message::Text(frame.to_string().into()))
        .await;
}

async fn run_code(
    sink: SharedSink,
    vars: Arc<Mutex<HashMap<String, String>>>,
    mut interrupt_rx: broadcast::Receiver<()>,
    execution_id: String,
    code: String,
) {
    emit(
        &sink,
        &execution_id,
        "status",
        serde_json::json!({"execution_state": "busy"}),
    )
    .await;

    if let Some(text) = code.strip_prefix("print:") {
        emit(
            &sink,
            &execution_id,
            "stream",
            serde_json::json!({"name": "stdout", "text": format!("{text}\n")}),
        )
        .await;
    } else if let Some(rest) = code.strip_prefix("chunks:") {
        let (count, label) = rest.split_once(':').unwrap();
        for i in 0..count.parse::<usize>().unwrap() {
            emit(
                &sink,
                &execution_id,
                "stream",
                serde_json::json!({"name": "stdout", "text": format!("{label} {i}\n")}),
            )
            .await;
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    } else if let Some(assignment) = code.strip_prefix("set:") {
        let (key, value) = assignment.split_once('=').unwrap();
        vars.lock().unwrap().insert(key.to_string(), value.to_string());
    } else if let Some(key) = code.strip_prefix("get:") {
        let value = vars.lock().unwrap().get(key).cloned();
        match value {
            Some(value) => {
                emit(
                    &sink,
                    &execution_id,
                    "stream",
                    serde_json::json!({"name": "stdout", "text": format!("{value}\n")}),
                )
                .await;
            }
            None => {
                emit(
                    &sink,
                    &execution_id,
                    "error",
                    serde_json::json!({
                        "name": "NameError",
                        "value": format!("name '{key}' is not defined"),
                        "traceback": [format!("NameError: name '{key}' is not defined")],
                    }),
                )
                .await;
            }
        }
    } else if let Some(millis) = code.strip_prefix("sleep:") {
        let duration = Duration::from_millis(millis.parse().unwrap());
        tokio::select! {
            _ = tokio::time::sleep(duration) => {
                emit(
                    &sink,
                    &execution_id,
                    "stream",
                    serde_json::json!({"name": "stdout", "text": "done\n"}),
                )
                .await;
            }
            _ = interrupt_rx.recv() => {
                emit(
                    &sink,
                    &execution_id,
                    "error",
                    serde_json::json!({
                        "name": "KeyboardInterrupt",
                        "value": "",
                        "traceback": ["KeyboardInterrupt"],
                    }),
                )
                .await;
            }
        }
    } else if let Some(rest) = code.strip_prefix("error:") {
        let (name, value) = rest.split_once(':').unwrap();
        emit(
            &sink,
            &execution_id,
            "error",
            serde_json::json!({
                "name": name,
                "value": value,
                "traceback": [format!("{name}: {value}")],
            }),
        )
        .await;
    } else if code == "image" {
        let payload = base64::engine::general_purpose::STANDARD.encode(FAKE_PNG);
        emit(
            &sink,
            &execution_id,
            "display_data",
            serde_json::json!({"data": {"text/plain": "<figure>", "image/png": payload}}),
        )
        .await;
    }

    emit(
        &sink,
        &execution_id,
        "status",
        serde_json::json!({"execution_state": "idle"}),
    )
    .await;
}

async fn spawn_gateway() -> (u16, GatewayState) {
    let state = GatewayState::default();
    let app = router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (port, state)
}

const TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_single_command_output() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let result = client.execute("print:Hello, world!", TIMEOUT).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("Hello, world!\n"));
    assert!(result.images.is_empty());
    assert!(result.error.is_none());

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_no_output() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let result = client.execute("set:x=1", TIMEOUT).await.unwrap();
    assert_eq!(result.text, None);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_streamed_chunks_aggregate_in_order() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let mut execution = client.submit("chunks:5:step").await.unwrap();
    let mut streamed = Vec::new();
    {
        let mut stream = std::pin::pin!(execution.stream(TIMEOUT));
        while let Some(chunk) = stream.next().await {
            streamed.push(chunk.unwrap());
        }
    }
    assert_eq!(streamed.len(), 5);

    let result = execution.result(TIMEOUT).await.unwrap();
    let expected: String = (0..5).map(|i| format!("step {i}\n")).collect();
    assert_eq!(result.text.as_deref(), Some(expected.as_str()));
    assert_eq!(streamed.concat(), expected);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_state_shared_within_session_not_across() {
    let (port, _) = spawn_gateway().await;

    let mut session_a = ExecutionClient::connect("127.0.0.1", port).await.unwrap();
    session_a.execute("set:x=1", TIMEOUT).await.unwrap();
    let result = session_a.execute("get:x", TIMEOUT).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("1\n"));

    let mut session_b = ExecutionClient::connect("127.0.0.1", port).await.unwrap();
    let result = session_b.execute("get:x", TIMEOUT).await.unwrap();
    let error = result.error.expect("expected NameError");
    assert_eq!(error.name, "NameError");
    assert!(error.value.contains("name 'x' is not defined"));

    session_a.close().await.unwrap();
    session_b.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_interrupts_and_session_stays_usable() {
    let (port, state) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let result = client
        .execute("sleep:30000", Duration::from_millis(500))
        .await;
    assert!(matches!(result, Err(KernelError::Timeout { .. })));
    assert_eq!(state.interrupted.lock().unwrap().len(), 1);

    let result = client.execute("print:1", TIMEOUT).await.unwrap();
    assert_eq!(result.text.as_deref(), Some("1\n"));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_error_record_captured() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let result = client
        .execute("error:ZeroDivisionError:division by zero", TIMEOUT)
        .await
        .unwrap();
    let error = result.error.clone().expect("expected error record");
    assert_eq!(error.name, "ZeroDivisionError");
    assert_eq!(error.value, "division by zero");
    assert!(error.trace.contains("ZeroDivisionError"));

    assert!(matches!(
        result.into_result(),
        Err(KernelError::Execution(_))
    ));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_image_output_decoded() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let result = client.execute("image", TIMEOUT).await.unwrap();
    assert_eq!(result.images.len(), 1);
    assert_eq!(result.images[0].mime, "image/png");
    assert_eq!(result.images[0].data, FAKE_PNG);

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_executions_demultiplexed() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let slow = client.submit("chunks:4:slow").await.unwrap();
    let fast = client.submit("print:fast").await.unwrap();

    // The fast execution finishes while slow chunks are still arriving;
    // routing by parent id must keep the buffers separate.
    let fast_result = fast.result(TIMEOUT).await.unwrap();
    assert_eq!(fast_result.text.as_deref(), Some("fast\n"));

    let slow_result = slow.result(TIMEOUT).await.unwrap();
    let expected: String = (0..4).map(|i| format!("slow {i}\n")).collect();
    assert_eq!(slow_result.text.as_deref(), Some(expected.as_str()));

    client.close().await.unwrap();
}

#[tokio::test]
async fn test_connection_loss_fails_pending_and_session() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let execution = client.submit("die").await.unwrap();
    let result = execution.result(TIMEOUT).await;
    assert!(matches!(result, Err(KernelError::ConnectionLost { .. })));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        client.state(),
        SessionState::Disconnected { .. }
    ));
    assert!(matches!(
        client.submit("print:1").await,
        Err(KernelError::ConnectionLost { .. })
    ));

    let _ = client.close().await;
}

#[tokio::test]
async fn test_close_deletes_kernel_and_is_idempotent() {
    let (port, state) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();
    let kernel_id = client.kernel_id().to_string();

    client.close().await.unwrap();
    client.close().await.unwrap();

    assert_eq!(state.deleted.lock().unwrap().as_slice(), &[kernel_id]);
}

#[tokio::test]
async fn test_execution_state_transitions() {
    let (port, _) = spawn_gateway().await;
    let mut client = ExecutionClient::connect("127.0.0.1", port).await.unwrap();

    let mut execution = client.submit("print:x").await.unwrap();
    assert_eq!(execution.state(), ExecutionState::Pending);
    {
        let mut stream = std::pin::pin!(execution.stream(TIMEOUT));
        while stream.next().await.is_some() {}
    }
    assert!(execution.state().is_terminal());
    assert_eq!(execution.state(), ExecutionState::Completed);

    client.close().await.unwrap();
}
