//! Gateway channel message envelope and classification
//!
//! Channel messages are JSON frames shaped as
//! `{header: {id, type, ...}, parent_header: {id, ...}, content: {...}}`.
//! The envelope is schemaless beyond those fields; content is interpreted
//! per message type and unknown types are ignored by the caller.

use base64::Engine;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ExecutionFailure;
use crate::execution::ImageData;

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct MessageHeader {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ParentHeader {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChannelMessage {
    pub header: MessageHeader,
    #[serde(default)]
    pub parent_header: ParentHeader,
    #[serde(default)]
    pub content: Value,
}

/// Output event for one execution, extracted from a channel message
#[derive(Debug, Clone)]
pub(crate) enum KernelEvent {
    /// A text chunk from the kernel's output stream
    Chunk(String),
    /// A decoded raster image
    Image(ImageData),
    /// A kernel-reported exception
    Error(ExecutionFailure),
    /// The idle marker: sole termination signal for the execution
    Idle,
}

/// Serialize an execute request for the given execution id
pub(crate) fn execute_request(execution_id: &str, code: &str) -> String {
    serde_json::json!({
        "header": {"id": execution_id, "type": "execute_request"},
        "parent_header": {},
        "content": {
            "code": code,
            "silent": false,
            "store_history": false,
            "allow_stdin": false,
        },
    })
    .to_string()
}

/// Classify a channel message into an execution event.
///
/// Returns `None` for message types that carry no output for the parent
/// execution (busy status, execute_input echoes, unknown types).
pub(crate) fn classify(msg: &ChannelMessage) -> Option<KernelEvent> {
    match msg.header.kind.as_str() {
        "status" => {
            let state = msg.content.get("execution_state").and_then(Value::as_str);
            (state == Some("idle")).then_some(KernelEvent::Idle)
        }
        "stream" => msg
            .content
            .get("text")
            .and_then(Value::as_str)
            .map(|text| KernelEvent::Chunk(text.to_string())),
        "display_data" | "execute_result" => {
            let data = msg.content.get("data")?.as_object()?;
            let (mime, payload) = data
                .iter()
                .find(|(key, _)| key.starts_with("image/"))
                .and_then(|(key, value)| value.as_str().map(|v| (key.clone(), v)))?;
            match base64::engine::general_purpose::STANDARD.decode(payload.trim()) {
                Ok(bytes) => Some(KernelEvent::Image(ImageData { mime, data: bytes })),
                Err(e) => {
                    tracing::warn!(mime = %mime, error = %e, "undecodable image payload");
                    None
                }
            }
        }
        "error" => {
            let text = |key: &str| {
                msg.content
                    .get(key)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };
            let trace = match msg.content.get("traceback").and_then(Value::as_array) {
                Some(lines) => lines
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join("\n"),
                None => String::new(),
            };
            Some(KernelEvent::Error(ExecutionFailure {
                name: text("name"),
                value: text("value"),
                trace: strip_ansi(&trace),
            }))
        }
        _ => None,
    }
}

/// Strip ANSI escape sequences from kernel tracebacks
pub(crate) fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            if chars.peek() == Some(&'[') {
                chars.next();
                // CSI sequence: parameters and intermediates, then a final
                // byte in 0x40..=0x7e
                for seq in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&seq) {
                        break;
                    }
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(json: &str) -> ChannelMessage {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_idle_marker() {
        let msg = message(
            r#"{"header": {"id": "m1", "type": "status"},
                "parent_header": {"id": "e1"},
                "content": {"execution_state": "idle"}}"#,
        );
        assert!(matches!(classify(&msg), Some(KernelEvent::Idle)));
        assert_eq!(msg.parent_header.id.as_deref(), Some("e1"));
    }

    #[test]
    fn test_busy_status_is_not_terminal() {
        let msg = message(
            r#"{"header": {"id": "m1", "type": "status"},
                "parent_header": {"id": "e1"},
                "content": {"execution_state": "busy"}}"#,
        );
        assert!(classify(&msg).is_none());
    }

    #[test]
    fn test_stream_chunk() {
        let msg = message(
            r#"{"header": {"id": "m2", "type": "stream"},
                "parent_header": {"id": "e1"},
                "content": {"name": "stdout", "text": "Hello\n"}}"#,
        );
        match classify(&msg) {
            Some(KernelEvent::Chunk(text)) => assert_eq!(text, "Hello\n"),
            other => panic!("expected chunk, got {other:?}"),
        }
    }

    #[test]
    fn test_image_payload_decoded() {
        // "hi" in base64
        let msg = message(
            r#"{"header": {"id": "m3", "type": "display_data"},
                "parent_header": {"id": "e1"},
                "content": {"data": {"text/plain": "<img>", "image/png": "aGk="}}}"#,
        );
        match classify(&msg) {
            Some(KernelEvent::Image(image)) => {
                assert_eq!(image.mime, "image/png");
                assert_eq!(image.data, b"hi");
            }
            other => panic!("expected image, got {other:?}"),
        }
    }

    #[test]
    fn test_display_data_without_image_ignored() {
        let msg = message(
            r#"{"header": {"id": "m3", "type": "display_data"},
                "parent_header": {"id": "e1"},
                "content": {"data": {"text/plain": "42"}}}"#,
        );
        assert!(classify(&msg).is_none());
    }

    #[test]
    fn test_error_record() {
        let msg = message(
            r#"{"header": {"id": "m4", "type": "error"},
                "parent_header": {"id": "e1"},
                "content": {"name": "ZeroDivisionError",
                            "value": "division by zero",
                            "traceback": ["\u001b[31mTraceback\u001b[0m", "  2 / 0"]}}"#,
        );
        match classify(&msg) {
            Some(KernelEvent::Error(failure)) => {
                assert_eq!(failure.name, "ZeroDivisionError");
                assert_eq!(failure.value, "division by zero");
                assert_eq!(failure.trace, "Traceback\n  2 / 0");
            }
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_type_ignored() {
        let msg = message(
            r#"{"header": {"id": "m5", "type": "comm_open"},
                "parent_header": {"id": "e1"},
                "content": {}}"#,
        );
        assert!(classify(&msg).is_none());
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("\u{1b}[0;31mred\u{1b}[0m text"), "red text");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
    fn test_execute_request_shape() {
        let raw = execute_request("e1", "print(1)");
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["header"]["id"], "e1");
        assert_eq!(value["header"]["type"], "execute_request");
        assert_eq!(value["content"]["code"], "print(1)");
        assert_eq!(value["content"]["silent"], false);
        assert_eq!(value["content"]["store_history"], false);
        assert_eq!(value["content"]["allow_stdin"], false);
    }
}
