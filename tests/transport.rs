//! Integration tests driving the transport server end to end over a real
//! TCP socket: the `/health` HTTP probe sharing the port with the WebSocket
//! `/lsp` upgrade, path-based upgrade rejection, and the oversized-frame
//! boundary behavior from spec.md §8 ("oversized frame -> -32600, connection
//! preserved").

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;

use lsp_bridge::analyzer::AnalyzerManager;
use lsp_bridge::config::Config;
use lsp_bridge::transport::{self, AppContext};
use lsp_bridge::workspace::WorkspaceStore;

/// Reserve an ephemeral port by binding then immediately releasing it. Races
/// against another process grabbing the same port between release and the
/// server's own bind are vanishingly unlikely in a test run.
fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct RunningServer {
    port: u16,
    shutdown: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl RunningServer {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

async fn spawn_server(workspace_root: &std::path::Path, max_frame_bytes: usize) -> RunningServer {
    let port = free_port();
    let mut config = Config::default();
    config.port = port;
    config.workspace_root = workspace_root.to_path_buf();
    config.max_frame_bytes = max_frame_bytes;
    let config = Arc::new(config);
    let workspace = Arc::new(WorkspaceStore::new(config.workspace_root.clone()));
    let analyzers = Arc::new(AnalyzerManager::new(config.clone()));
    let ctx = Arc::new(AppContext {
        config,
        workspace,
        analyzers,
        started_at: Instant::now(),
    });
    let (shutdown, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(transport::run(ctx, shutdown_rx));

    // Give the accept loop a moment to bind before the test connects.
    tokio::time::sleep(Duration::from_millis(100)).await;

    RunningServer {
        port,
        shutdown,
        handle,
    }
}

#[tokio::test]
async fn health_endpoint_reports_ok_and_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_server(dir.path(), 16 * 1024 * 1024).await;

    let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", server.port))
        .await
        .unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut buf = vec![0u8; 4096];
    let n = stream.read(&mut buf).await.unwrap();
    let response = String::from_utf8_lossy(&buf[..n]).into_owned();

    assert!(response.starts_with("HTTP/1.1 200 OK"));
    let body_start = response.find("\r\n\r\n").unwrap() + 4;
    let body: Value = serde_json::from_str(&response[body_start..]).unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["timestamp"].as_u64().unwrap() > 0);
    assert!(body["workspace"].as_str().unwrap().contains(
        dir.path()
            .file_name()
            .unwrap()
            .to_str()
            .unwrap()
    ));

    server.stop().await;
}

#[tokio::test]
async fn rejects_websocket_upgrade_on_wrong_path() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_server(dir.path(), 16 * 1024 * 1024).await;

    let url = format!("ws://127.0.0.1:{}/not-lsp", server.port);
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err(), "upgrade on the wrong path should be refused");

    server.stop().await;
}

#[tokio::test]
async fn initialize_round_trips_over_a_real_websocket() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_server(dir.path(), 16 * 1024 * 1024).await;

    let url = format!("ws://127.0.0.1:{}/lsp", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(Message::Text(
        json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": { "processId": 1, "rootUri": "file:///", "capabilities": {} }
        })
        .to_string(),
    ))
    .await
    .unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["id"], 1);
    assert_eq!(value["result"]["capabilities"]["hoverProvider"], true);
    assert_eq!(value["result"]["capabilities"]["textDocumentSync"], 1);

    server.stop().await;
}

/// spec.md §8: "Oversized WebSocket frame -> -32600, connection preserved."
#[tokio::test]
async fn oversized_frame_is_rejected_but_connection_stays_open() {
    let dir = tempfile::tempdir().unwrap();
    let server = spawn_server(dir.path(), 64).await;

    let url = format!("ws://127.0.0.1:{}/lsp", server.port);
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let oversized = json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "initialize",
        "params": { "padding": "x".repeat(500) }
    })
    .to_string();
    ws.send(Message::Text(oversized)).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text) = reply else {
        panic!("expected a text frame, got {reply:?}");
    };
    let value: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["error"]["code"], -32600);

    // The connection is still usable for a normally sized message afterwards.
    ws.send(Message::Text(
        json!({ "jsonrpc": "2.0", "id": 2, "method": "initialize", "params": {} }).to_string(),
    ))
    .await
    .unwrap();
    let reply2 = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let Message::Text(text2) = reply2 else {
        panic!("expected a text frame, got {reply2:?}");
    };
    let value2: Value = serde_json::from_str(&text2).unwrap();
    assert_eq!(value2["id"], 2);

    server.stop().await;
}
