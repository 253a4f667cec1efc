//! Framed JSON-RPC codec.
//!
//! Two wire forms share the same JSON-RPC 2.0 message shape:
//!   - stdio to an analyzer: `Content-Length: <N>\r\n\r\n` + N bytes of UTF-8 JSON.
//!   - WebSocket to a browser: one JSON message per frame (tungstenite owns framing).
//!
//! `RpcMessage` is the tagged variant the rest of the proxy inspects instead
//! of passing raw `serde_json::Value` around — payloads (`params`/`result`/
//! `error.data`) are kept as opaque `Value`s and are only inspected at
//! handler boundaries (e.g. to read `params.textDocument.uri`).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::ProxyError;
pub use crate::error::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A parsed JSON-RPC 2.0 message, classified by shape rather than by a
/// `method` allowlist: a *request* has both `id` and `method`; a *response*
/// has `id` and either `result` or `error`; a *notification* has `method`
/// but no `id`.
#[derive(Debug, Clone)]
pub enum RpcMessage {
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<RpcErrorObject>,
    },
}

/// Raw shape used only for (de)serialization; `classify` turns this into the
/// tagged `RpcMessage` the rest of the codebase works with.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

/// Classify a parsed JSON object by shape. Returns `ProtocolError` for a
/// request missing `method` (an object carrying neither `method` nor a
/// `result`/`error` pair is not a valid JSON-RPC message).
pub fn classify(value: Value) -> Result<RpcMessage, ProxyError> {
    let raw: RawMessage = serde_json::from_value(value)
        .map_err(|e| ProxyError::Protocol(format!("invalid JSON-RPC envelope: {e}")))?;

    match (raw.id, raw.method) {
        (Some(id), Some(method)) => Ok(RpcMessage::Request {
            id,
            method,
            params: raw.params,
        }),
        (None, Some(method)) => Ok(RpcMessage::Notification {
            method,
            params: raw.params,
        }),
        (Some(id), None) => {
            if raw.result.is_some() || raw.error.is_some() {
                Ok(RpcMessage::Response {
                    id,
                    result: raw.result,
                    error: raw.error,
                })
            } else {
                Err(ProxyError::Protocol(
                    "invalid request: message has an id but neither method, result, nor error"
                        .to_string(),
                ))
            }
        }
        (None, None) => Err(ProxyError::Protocol(
            "invalid request: missing method".to_string(),
        )),
    }
}

impl RpcMessage {
    pub fn to_value(&self) -> Value {
        match self {
            RpcMessage::Request { id, method, params } => serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }),
            RpcMessage::Notification { method, params } => serde_json::json!({
                "jsonrpc": "2.0",
                "method": method,
                "params": params,
            }),
            RpcMessage::Response { id, result, error } => {
                let mut obj = serde_json::json!({ "jsonrpc": "2.0", "id": id });
                let map = obj.as_object_mut().unwrap();
                if let Some(result) = result {
                    map.insert("result".to_string(), result.clone());
                } else if let Some(error) = error {
                    map.insert("error".to_string(), serde_json::to_value(error).unwrap());
                }
                obj
            }
        }
    }
}

pub fn error_response(id: Value, code: i32, message: impl Into<String>) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message.into() }
    })
}

/// Per-analyzer monotonically increasing outbound request id counter.
#[derive(Debug, Default)]
pub struct RequestIdGen(AtomicI64);

impl RequestIdGen {
    pub fn new() -> Self {
        Self(AtomicI64::new(1))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

// ─── stdio Content-Length framing ───────────────────────────────────────────

/// Read one `Content-Length`-framed JSON-RPC message from an analyzer's
/// stdout. Returns `Ok(None)` on clean EOF (the child closed stdout).
pub async fn read_framed_message<R>(reader: &mut R) -> Result<Option<Value>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        let bytes_read = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProxyError::Transport(format!("stdio read error: {e}")))?;
        if bytes_read == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break; // blank line terminates the header block
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = Some(value.trim().parse().map_err(|e| {
                ProxyError::Protocol(format!("malformed Content-Length header: {e}"))
            })?);
        }
        // Other headers (e.g. Content-Type) are accepted and ignored.
    }

    let length = content_length
        .ok_or_else(|| ProxyError::Protocol("framing error: missing Content-Length".to_string()))?;

    let mut body = vec![0u8; length];
    tokio::io::AsyncReadExt::read_exact(reader, &mut body)
        .await
        .map_err(|e| ProxyError::Transport(format!("truncated body: {e}")))?;

    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::Protocol(format!("invalid JSON in framed body: {e}")))?;
    Ok(Some(value))
}

/// Write one `Content-Length`-framed JSON-RPC message to an analyzer's stdin.
pub async fn write_framed_message<W>(writer: &mut W, value: &Value) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| ProxyError::Protocol(format!("failed to serialize message: {e}")))?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer
        .write_all(header.as_bytes())
        .await
        .map_err(|e| ProxyError::Transport(format!("stdio write error: {e}")))?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| ProxyError::Transport(format!("stdio write error: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| ProxyError::Transport(format!("stdio flush error: {e}")))?;
    Ok(())
}

#[allow(dead_code)]
fn assert_async_read<T: AsyncRead>() {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tokio::io::BufReader;

    #[test]
    fn classify_request_has_id_and_method() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}});
        match classify(v).unwrap() {
            RpcMessage::Request { id, method, .. } => {
                assert_eq!(id, serde_json::json!(1));
                assert_eq!(method, "initialize");
            }
            other => panic!("expected Request, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification_has_no_id() {
        let v = serde_json::json!({"jsonrpc":"2.0","method":"textDocument/didOpen","params":{}});
        assert!(matches!(
            classify(v).unwrap(),
            RpcMessage::Notification { .. }
        ));
    }

    #[test]
    fn classify_response_has_result() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"ok":true}});
        assert!(matches!(classify(v).unwrap(), RpcMessage::Response { .. }));
    }

    #[test]
    fn classify_response_has_error() {
        let v = serde_json::json!({"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"nope"}});
        assert!(matches!(classify(v).unwrap(), RpcMessage::Response { .. }));
    }

    #[test]
    fn classify_rejects_missing_method() {
        let v = serde_json::json!({"jsonrpc":"2.0","params":{}});
        assert!(classify(v).is_err());
    }

    #[test]
    fn request_id_gen_is_monotonic_and_starts_at_one() {
        let gen = RequestIdGen::new();
        assert_eq!(gen.next(), 1);
        assert_eq!(gen.next(), 2);
        assert_eq!(gen.next(), 3);
    }

    #[tokio::test]
    async fn roundtrip_framed_message() {
        let msg = serde_json::json!({"jsonrpc":"2.0","id":1,"method":"initialize","params":{}});
        let mut buf = Vec::new();
        write_framed_message(&mut buf, &msg).await.unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        let decoded = read_framed_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn read_framed_message_returns_none_on_eof() {
        let mut reader = BufReader::new(Cursor::new(Vec::<u8>::new()));
        let result = read_framed_message(&mut reader).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn read_framed_message_rejects_missing_content_length() {
        let raw = b"Content-Type: application/json\r\n\r\n{}".to_vec();
        let mut reader = BufReader::new(Cursor::new(raw));
        let result = read_framed_message(&mut reader).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_framed_message_handles_multiple_messages_back_to_back() {
        let mut buf = Vec::new();
        write_framed_message(&mut buf, &serde_json::json!({"jsonrpc":"2.0","method":"a"}))
            .await
            .unwrap();
        write_framed_message(&mut buf, &serde_json::json!({"jsonrpc":"2.0","method":"b"}))
            .await
            .unwrap();

        let mut reader = BufReader::new(Cursor::new(buf));
        let first = read_framed_message(&mut reader).await.unwrap().unwrap();
        let second = read_framed_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(first["method"], "a");
        assert_eq!(second["method"], "b");
    }
}
