//! WebSocket transport server. Accepts connections on a single TCP port
//! shared between the LSP WebSocket upgrade and a plain HTTP `/health`
//! check, using a peek-based protocol sniff to multiplex the one port.

use std::sync::Arc;
use std::time::Instant;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http;
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::analyzer::AnalyzerManager;
use crate::codec;
use crate::config::Config;
use crate::proxy::ProxySession;
use crate::workspace::WorkspaceStore;

pub struct AppContext {
    pub config: Arc<Config>,
    pub workspace: Arc<WorkspaceStore>,
    pub analyzers: Arc<AnalyzerManager>,
    pub started_at: Instant,
}

/// Runs the accept loop until `shutdown` resolves true. Every accepted
/// connection is tracked in a `JoinSet` and also given its own clone of
/// `shutdown`, so once the accept loop stops, `run` waits here for each
/// in-flight session to notice the signal and tear itself down (sending
/// `didClose` for its open documents) before returning — this is what makes
/// closing existing sessions on shutdown actually wait rather than firing
/// and forgetting.
pub async fn run(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, "transport server listening (WebSocket /lsp + HTTP /health)");

    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("shutdown signal received — stopping accept loop");
                    break;
                }
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                let conn_shutdown = shutdown.clone();
                connections.spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx, conn_shutdown).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!(pending = connections.len(), "draining in-flight sessions");
    while connections.join_next().await.is_some() {}
    info!("all sessions drained");

    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    ctx: Arc<AppContext>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut peek_buf = [0u8; 12];
    let n = stream.peek(&mut peek_buf).await.unwrap_or(0);
    if n >= 12 && &peek_buf[..12] == b"GET /health " {
        return handle_health_check(stream, &ctx).await;
    }

    // Frame size is enforced manually below rather than via tungstenite's own
    // `max_message_size`/`max_frame_size`: those abort the connection on an
    // oversized frame, but an oversized frame here should produce a `-32600`
    // reply with the connection kept open.
    let ws_path = ctx.config.ws_path.clone();
    let path_check = move |req: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if req.uri().path() == ws_path {
            Ok(response)
        } else {
            let body = Some(format!("no such endpoint; expected {ws_path}"));
            Err(http::Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(body)
                .expect("building a static error response never fails"))
        }
    };
    let ws = match tokio_tungstenite::accept_hdr_async_with_config(
        stream,
        path_check,
        Some(WebSocketConfig::default()),
    )
    .await
    {
        Ok(ws) => ws,
        Err(e) => {
            debug!(err = %e, "rejected upgrade for unrecognized path");
            return Ok(());
        }
    };
    let (mut sink, mut stream) = ws.split();

    let session_id = Uuid::new_v4().to_string();
    let (client_tx, mut client_rx) = mpsc::unbounded_channel::<Value>();
    let session = Arc::new(ProxySession::new(
        session_id.clone(),
        ctx.workspace.clone(),
        ctx.analyzers.clone(),
        client_tx,
    ));

    info!(session = %session_id, "session opened");

    loop {
        tokio::select! {
            biased;

            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!(session = %session_id, "shutdown signal received — closing session");
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }

            outgoing = client_rx.recv() => {
                match outgoing {
                    Some(value) => {
                        if let Err(e) = sink.send(Message::Text(value.to_string())).await {
                            warn!(session = %session_id, err = %e, "send error, closing session");
                            break;
                        }
                    }
                    None => break,
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if text.len() > ctx.config.max_frame_bytes {
                            let reply = codec::error_response(
                                Value::Null,
                                codec::INVALID_REQUEST,
                                format!("frame exceeds {} bytes", ctx.config.max_frame_bytes),
                            );
                            let _ = sink.send(Message::Text(reply.to_string())).await;
                            continue;
                        }
                        match serde_json::from_str::<Value>(&text) {
                            Ok(value) => session.handle_message(value).await,
                            Err(e) => {
                                warn!(session = %session_id, err = %e, "parse error");
                                let reply = codec::error_response(
                                    Value::Null,
                                    codec::PARSE_ERROR,
                                    "Parse error",
                                );
                                let _ = sink.send(Message::Text(reply.to_string())).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(session = %session_id, err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    session.close().await;
    info!(session = %session_id, "session closed");
    Ok(())
}

async fn handle_health_check(mut stream: TcpStream, ctx: &AppContext) -> anyhow::Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let mut req_buf = [0u8; 256];
    let _ = stream.read(&mut req_buf).await;

    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let body = serde_json::json!({
        "status": "ok",
        "timestamp": timestamp,
        "workspace": ctx.workspace.root().display().to_string(),
    });
    let body_str = body.to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body_str.len(),
        body_str
    );
    stream.write_all(response.as_bytes()).await?;
    Ok(())
}
