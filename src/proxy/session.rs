//! One `ProxySession` per WebSocket connection: routes inbound LSP
//! requests/notifications to the right analyzer, serializes handlers per
//! document URI, and owns the set of URIs this client has open so they can
//! all be closed cleanly on disconnect.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::analyzer::AnalyzerManager;
use crate::codec::{self, RpcMessage};
use crate::error::{ProxyError, ProxyResult};
use crate::workspace::WorkspaceStore;

use super::content_sync;
use super::rewrite;
use super::uri_lock::UriLockMap;

/// Outbound channel a session writes client-bound JSON-RPC messages to; the
/// transport layer owns draining this into the actual WebSocket sink.
pub type ClientSink = mpsc::UnboundedSender<Value>;

pub struct ProxySession {
    id: String,
    workspace: Arc<WorkspaceStore>,
    analyzers: Arc<AnalyzerManager>,
    client_sink: ClientSink,
    uri_locks: UriLockMap,
    /// URIs opened from this session, with the languageId they were opened
    /// under — needed to route `didClose` to the right analyzer on teardown.
    open_uris: Mutex<HashSet<(String, String)>>,
}

impl ProxySession {
    pub fn new(
        id: String,
        workspace: Arc<WorkspaceStore>,
        analyzers: Arc<AnalyzerManager>,
        client_sink: ClientSink,
    ) -> Self {
        Self {
            id,
            workspace,
            analyzers,
            client_sink,
            uri_locks: UriLockMap::new(),
            open_uris: Mutex::new(HashSet::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handle one inbound JSON-RPC message already parsed from the socket.
    /// Requests produce exactly one reply on the client sink; notification
    /// errors are logged, not replied.
    pub async fn handle_message(&self, value: Value) {
        let message = match codec::classify(value) {
            Ok(m) => m,
            Err(e) => {
                warn!(session = %self.id, err = %e, "dropping malformed message");
                return;
            }
        };

        match message {
            RpcMessage::Request { id, method, params } => {
                let params = params.unwrap_or(Value::Null);
                let result = self.dispatch_request(&method, params).await;
                let reply = match result {
                    Ok(value) => RpcMessage::Response {
                        id,
                        result: Some(value),
                        error: None,
                    }
                    .to_value(),
                    Err(e) => {
                        let (code, message) = e.to_rpc_error();
                        codec::error_response(id, code, message)
                    }
                };
                let _ = self.client_sink.send(reply);
            }
            RpcMessage::Notification { method, params } => {
                let params = params.unwrap_or(Value::Null);
                if let Err(e) = self.dispatch_notification(&method, params).await {
                    warn!(session = %self.id, method = %method, err = %e, "notification handler error");
                }
            }
            RpcMessage::Response { .. } => {
                // Clients don't send us responses in this protocol subset.
                debug!(session = %self.id, "ignoring unexpected response-shaped message");
            }
        }
    }

    async fn dispatch_request(&self, method: &str, params: Value) -> ProxyResult<Value> {
        match method {
            "initialize" => Ok(initialize_result()),
            "textDocument/completion" => self.forward_document_request(params, "textDocument/completion").await,
            "textDocument/hover" => self.forward_document_request(params, "textDocument/hover").await,
            "textDocument/definition" => self.forward_document_request(params, "textDocument/definition").await,
            "textDocument/references" => self.forward_document_request(params, "textDocument/references").await,
            "textDocument/formatting" => self.forward_document_request(params, "textDocument/formatting").await,
            other => Err(ProxyError::MethodNotFound(other.to_string())),
        }
    }

    async fn dispatch_notification(&self, method: &str, params: Value) -> ProxyResult<()> {
        match method {
            "initialized" => Ok(()),
            "textDocument/didOpen" => self.handle_did_open(params).await,
            "textDocument/didChange" => self.handle_did_change(params).await,
            "textDocument/didClose" => self.handle_did_close(params).await,
            "textDocument/didSave" => self.handle_did_save(params).await,
            other => {
                debug!(method = other, "ignoring unhandled notification");
                Ok(())
            }
        }
    }

    async fn handle_did_open(&self, params: Value) -> ProxyResult<()> {
        let uri = text_document_uri(&params)?;
        let _guard = self.uri_locks.lock(&uri).await;

        let text = params["textDocument"]["text"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let language_id = params["textDocument"]["languageId"]
            .as_str()
            .unwrap_or("plaintext")
            .to_string();

        // Idempotent: re-opening an already-tracked URI leaves its version as
        // the last stored one rather than resetting to 1.
        if !self.workspace.has_file(&uri).await? {
            if let Err(e) = self.workspace.create_file(&uri, &text, &language_id).await {
                warn!(uri = %uri, err = %e, "didOpen: failed to persist file, continuing in-memory");
            }
        }

        self.open_uris
            .lock()
            .await
            .insert((uri.clone(), language_id.clone()));

        let analyzer = self.analyzers.get_or_spawn(&language_id).await?;
        analyzer.rebind_sink(self.client_forwarding_sink()).await?;

        let doc = self
            .workspace
            .read_file(&uri)
            .await
            .unwrap_or(crate::workspace::DocumentSnapshot {
                text: text.clone(),
                version: 1,
                language_id: language_id.clone(),
            });

        analyzer
            .send_notification(
                "textDocument/didOpen",
                json!({
                    "textDocument": {
                        "uri": rewrite::to_analyzer(&uri, self.workspace.root()),
                        "languageId": doc.language_id,
                        "version": doc.version,
                        "text": doc.text,
                    }
                }),
            )
            .await
    }

    async fn handle_did_change(&self, params: Value) -> ProxyResult<()> {
        let uri = text_document_uri(&params)?;
        let _guard = self.uri_locks.lock(&uri).await;

        let changes = params["contentChanges"]
            .as_array()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ProxyError::Protocol("didChange missing contentChanges".to_string()))?;

        // spec.md §4.5: the analyzer always gets a single full-text change,
        // even when the client sent incremental deltas — reconstruct the
        // full document from the last known version before forwarding.
        let base_text = match self.workspace.read_file(&uri).await {
            Ok(snapshot) => snapshot.text,
            Err(_) => String::new(),
        };
        let text = content_sync::apply_content_changes(&base_text, changes)?;

        let version = self.workspace.update_file(&uri, &text).await?;
        let language_id = self
            .workspace
            .doc_meta(&uri)
            .await
            .map(|m| m.language_id)
            .unwrap_or_else(|| "plaintext".to_string());

        self.open_uris
            .lock()
            .await
            .insert((uri.clone(), language_id.clone()));

        let analyzer = self.analyzers.get_or_spawn(&language_id).await?;
        analyzer
            .send_notification(
                "textDocument/didChange",
                json!({
                    "textDocument": { "uri": rewrite::to_analyzer(&uri, self.workspace.root()), "version": version },
                    "contentChanges": [{ "text": text }],
                }),
            )
            .await
    }

    async fn handle_did_close(&self, params: Value) -> ProxyResult<()> {
        let uri = text_document_uri(&params)?;
        let _guard = self.uri_locks.lock(&uri).await;

        let language_id = {
            let mut open = self.open_uris.lock().await;
            let found = open.iter().find(|(u, _)| u == &uri).cloned();
            if let Some(entry) = &found {
                open.remove(entry);
            }
            found.map(|(_, lang)| lang)
        };

        let Some(language_id) = language_id else {
            return Ok(());
        };

        let analyzer = self.analyzers.get_or_spawn(&language_id).await?;
        analyzer
            .send_notification(
                "textDocument/didClose",
                json!({ "textDocument": { "uri": rewrite::to_analyzer(&uri, self.workspace.root()) } }),
            )
            .await
    }

    async fn handle_did_save(&self, params: Value) -> ProxyResult<()> {
        let uri = text_document_uri(&params)?;
        let _guard = self.uri_locks.lock(&uri).await;

        let language_id = self
            .workspace
            .doc_meta(&uri)
            .await
            .map(|m| m.language_id)
            .unwrap_or_else(|| "plaintext".to_string());

        let analyzer = self.analyzers.get_or_spawn(&language_id).await?;
        analyzer
            .send_notification(
                "textDocument/didSave",
                json!({ "textDocument": { "uri": rewrite::to_analyzer(&uri, self.workspace.root()) } }),
            )
            .await
    }

    async fn forward_document_request(&self, mut params: Value, method: &str) -> ProxyResult<Value> {
        let uri = text_document_uri(&params)?;
        let _guard = self.uri_locks.lock(&uri).await;

        let language_id = self
            .workspace
            .doc_meta(&uri)
            .await
            .map(|m| m.language_id)
            .ok_or_else(|| ProxyError::DocumentNotFound(uri.clone()))?;

        if let Some(obj) = params.pointer_mut("/textDocument/uri") {
            *obj = Value::String(rewrite::to_analyzer(&uri, self.workspace.root()));
        }

        let analyzer = self.analyzers.get_or_spawn(&language_id).await?;
        let result = analyzer.send_request(method, params).await?;
        Ok(rewrite_uris_in_value(result, self.workspace.root()))
    }

    /// A sink that rewrites any analyzer-space `uri` fields back to client
    /// space before forwarding to this session's socket — what
    /// `AnalyzerHandle::rebind_sink` binds to on `didOpen`.
    fn client_forwarding_sink(&self) -> mpsc::UnboundedSender<Value> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client_sink = self.client_sink.clone();
        let workspace_root = self.workspace.root().to_path_buf();
        tokio::spawn(async move {
            while let Some(value) = rx.recv().await {
                let _ = client_sink.send(rewrite_uris_in_value(value, &workspace_root));
            }
        });
        tx
    }

    /// Send `didClose` for every URI this session opened, then drop.
    /// Called by the transport layer when the socket closes.
    pub async fn close(&self) {
        let owned: Vec<(String, String)> = self.open_uris.lock().await.drain().collect();
        for (uri, language_id) in owned {
            let Ok(analyzer) = self.analyzers.get_or_spawn(&language_id).await else {
                continue;
            };
            let _ = analyzer
                .send_notification(
                    "textDocument/didClose",
                    json!({ "textDocument": { "uri": rewrite::to_analyzer(&uri, self.workspace.root()) } }),
                )
                .await;
        }
    }
}

fn text_document_uri(params: &Value) -> ProxyResult<String> {
    params["textDocument"]["uri"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| ProxyError::Protocol("missing params.textDocument.uri".to_string()))
}

/// Walk a JSON value rewriting every `"uri"` string field from analyzer
/// space to client space (recursively, so it covers a `definition` result's
/// `Location[]`, a `publishDiagnostics` notification, etc.).
fn rewrite_uris_in_value(mut value: Value, workspace_root: &Path) -> Value {
    rewrite_uris_mut(&mut value, workspace_root);
    value
}

fn rewrite_uris_mut(value: &mut Value, workspace_root: &Path) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(uri)) = map.get_mut("uri") {
                *uri = rewrite::to_client(uri, workspace_root);
            }
            for v in map.values_mut() {
                rewrite_uris_mut(v, workspace_root);
            }
        }
        Value::Array(items) => {
            for v in items.iter_mut() {
                rewrite_uris_mut(v, workspace_root);
            }
        }
        _ => {}
    }
}

/// The `initialize` response capability set.
fn initialize_result() -> Value {
    json!({
        "capabilities": {
            "textDocumentSync": 1,
            "completionProvider": {
                "triggerCharacters": [".", ":", "<", "\"", "/", "@"],
                "resolveProvider": false
            },
            "hoverProvider": true,
            "definitionProvider": true,
            "referencesProvider": true,
            "documentFormattingProvider": true
        },
        "serverInfo": {
            "name": "lsp-bridged",
            "version": env!("CARGO_PKG_VERSION")
        }
    })
}
