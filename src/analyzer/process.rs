//! Analyzer process state machine:
//!
//!   Spawning → Initializing → Running → Stopping → Stopped
//!
//! with a synthetic `Crashed` transition from any non-`Stopped` state that
//! immediately returns to `Spawning` if the restart budget allows it.
//!
//! One tokio task ("the actor") owns the child process end to end — its
//! stdin/stdout, the pending-request table, the idle timer, and the
//! currently-bound notification sink — for the lifetime of the entry,
//! across any number of crash-restarts. Callers talk to it only through
//! `AnalyzerHandle`, a cheap-to-clone command-channel front.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::BufReader;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::codec::{read_framed_message, write_framed_message, RequestIdGen};
use crate::error::{ProxyError, ProxyResult};
use crate::security::path_to_forward_slash;

use super::restart_budget::RestartBudget;

/// Delay between a crash and the next spawn attempt.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyzerState {
    Spawning,
    Initializing,
    Running,
    Stopping,
    Stopped,
}

impl AnalyzerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, AnalyzerState::Stopped)
    }
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    pub language_id: String,
    pub command: String,
    pub args: Vec<String>,
    pub workspace_root: std::path::PathBuf,
    pub init_timeout: Duration,
    pub idle_timeout: Duration,
    pub stop_grace_period: Duration,
    pub restart_budget: u32,
    pub restart_window: Duration,
}

/// An outbound message to forward to whichever session sink is currently
/// bound — the notification fan-out destination for analyzer-originated
/// pushes like `publishDiagnostics`.
pub type Sink = mpsc::UnboundedSender<Value>;

enum ActorCommand {
    SendRequest {
        method: String,
        params: Value,
        reply: oneshot::Sender<Result<Value, ProxyError>>,
    },
    SendNotification {
        method: String,
        params: Value,
    },
    Rebind {
        sink: Sink,
    },
    Stop,
}

/// A cheap, cloneable handle to a running (or restarting) analyzer entry.
#[derive(Clone)]
pub struct AnalyzerHandle {
    language_id: Arc<str>,
    tx: mpsc::Sender<ActorCommand>,
    state_rx: watch::Receiver<AnalyzerState>,
    pid: Arc<AtomicU32>,
}

impl AnalyzerHandle {
    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    pub fn state(&self) -> AnalyzerState {
        *self.state_rx.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::Relaxed) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub async fn send_request(&self, method: &str, params: Value) -> ProxyResult<Value> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ActorCommand::SendRequest {
                method: method.to_string(),
                params,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ProxyError::Transport("analyzer actor is gone".to_string()))?;
        reply_rx
            .await
            .map_err(|_| ProxyError::AnalyzerCrashed("analyzer dropped the request".to_string()))?
    }

    pub async fn send_notification(&self, method: &str, params: Value) -> ProxyResult<()> {
        self.tx
            .send(ActorCommand::SendNotification {
                method: method.to_string(),
                params,
            })
            .await
            .map_err(|_| ProxyError::Transport("analyzer actor is gone".to_string()))
    }

    pub async fn rebind_sink(&self, sink: Sink) -> ProxyResult<()> {
        self.tx
            .send(ActorCommand::Rebind { sink })
            .await
            .map_err(|_| ProxyError::Transport("analyzer actor is gone".to_string()))
    }

    pub async fn stop(&self) {
        let _ = self.tx.send(ActorCommand::Stop).await;
    }
}

/// Spawn the actor task and drive it through `Spawning → Initializing →
/// Running`. Returns once the analyzer is `Running`, or an error if the
/// binary could not be started or the initialize handshake failed/timed
/// out — both of which are `AnalyzerUnavailable` to the first caller.
pub async fn spawn_analyzer(config: AnalyzerConfig) -> ProxyResult<AnalyzerHandle> {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (state_tx, state_rx) = watch::channel(AnalyzerState::Spawning);
    let (ready_tx, ready_rx) = oneshot::channel();
    let pid = Arc::new(AtomicU32::new(0));

    let handle = AnalyzerHandle {
        language_id: Arc::from(config.language_id.as_str()),
        tx: cmd_tx,
        state_rx,
        pid: pid.clone(),
    };

    tokio::spawn(run_actor(config, cmd_rx, state_tx, pid, Some(ready_tx)));

    ready_rx
        .await
        .map_err(|_| ProxyError::AnalyzerUnavailable {
            language: handle.language_id.to_string(),
            reason: "actor exited before reporting readiness".to_string(),
        })?
        .map(|()| handle)
}

async fn run_actor(
    config: AnalyzerConfig,
    mut cmd_rx: mpsc::Receiver<ActorCommand>,
    state_tx: watch::Sender<AnalyzerState>,
    pid: Arc<AtomicU32>,
    mut first_ready: Option<oneshot::Sender<Result<(), ProxyError>>>,
) {
    let mut budget = RestartBudget::new(config.restart_budget, config.restart_window);
    let mut sink: Option<Sink> = None;

    loop {
        let _ = state_tx.send(AnalyzerState::Spawning);
        let spawned = spawn_child(&config);

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                report_unavailable(&mut first_ready, &config.language_id, e.to_string());
                let _ = state_tx.send(AnalyzerState::Stopped);
                return;
            }
        };

        pid.store(child.id().unwrap_or(0), Ordering::Relaxed);

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = child.stdout.take().expect("piped stdout");
        let mut writer = stdin;
        let mut reader = BufReader::new(stdout);
        let req_ids = RequestIdGen::new();

        let _ = state_tx.send(AnalyzerState::Initializing);
        let init_result = tokio::time::timeout(
            config.init_timeout,
            initialize_handshake(&mut writer, &mut reader, &config, &req_ids),
        )
        .await;

        match init_result {
            Ok(Ok(())) => {
                debug!(language = %config.language_id, "initialize handshake complete");
            }
            Ok(Err(e)) => {
                warn!(language = %config.language_id, err = %e, "initialize handshake failed");
                let _ = child.kill().await;
                if !handle_crash_or_give_up(
                    &mut budget,
                    &state_tx,
                    &mut first_ready,
                    &config.language_id,
                    "initialize handshake failed",
                    &mut sink,
                ) {
                    return;
                }
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
            Err(_) => {
                warn!(language = %config.language_id, "initialize handshake timed out");
                let _ = child.kill().await;
                if !handle_crash_or_give_up(
                    &mut budget,
                    &state_tx,
                    &mut first_ready,
                    &config.language_id,
                    "initialize timed out",
                    &mut sink,
                ) {
                    return;
                }
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        }

        let _ = state_tx.send(AnalyzerState::Running);
        if let Some(ready) = first_ready.take() {
            let _ = ready.send(Ok(()));
        }

        let outcome = run_connected(
            &mut cmd_rx,
            &mut writer,
            &mut reader,
            &config,
            &req_ids,
            &mut sink,
            &mut child,
        )
        .await;

        match outcome {
            ConnectedOutcome::StoppedByCommand => {
                let _ = state_tx.send(AnalyzerState::Stopping);
                shutdown_gracefully(&mut writer, &mut child, config.stop_grace_period).await;
                let _ = state_tx.send(AnalyzerState::Stopped);
                return;
            }
            ConnectedOutcome::Crashed(reason) => {
                warn!(language = %config.language_id, reason = %reason, "analyzer crashed");
                let _ = child.kill().await;
                if !handle_crash_or_give_up(
                    &mut budget,
                    &state_tx,
                    &mut first_ready,
                    &config.language_id,
                    &reason,
                    &mut sink,
                ) {
                    return;
                }
                tokio::time::sleep(RESTART_DELAY).await;
                continue;
            }
        }
    }
}

fn report_unavailable(
    first_ready: &mut Option<oneshot::Sender<Result<(), ProxyError>>>,
    language_id: &str,
    reason: String,
) {
    if let Some(ready) = first_ready.take() {
        let _ = ready.send(Err(ProxyError::AnalyzerUnavailable {
            language: language_id.to_string(),
            reason,
        }));
    }
}

/// Returns `true` if a restart was admitted and the caller should loop back
/// to `Spawning`; `false` if the budget is exhausted and the actor should
/// exit.
fn handle_crash_or_give_up(
    budget: &mut RestartBudget,
    state_tx: &watch::Sender<AnalyzerState>,
    first_ready: &mut Option<oneshot::Sender<Result<(), ProxyError>>>,
    language_id: &str,
    reason: &str,
    sink: &mut Option<Sink>,
) -> bool {
    if budget.try_consume() {
        info!(language = %language_id, "restarting analyzer after crash (budget allows it)");
        true
    } else {
        error!(language = %language_id, "analyzer restart budget exhausted — giving up");
        if let Some(sink) = sink.as_ref() {
            let _ = sink.send(json!({
                "jsonrpc": "2.0",
                "method": "window/showMessage",
                "params": {
                    "type": 1,
                    "message": format!(
                        "Language server for '{language_id}' crashed repeatedly and could not be restarted: {reason}"
                    )
                }
            }));
        }
        report_unavailable(first_ready, language_id, reason.to_string());
        let _ = state_tx.send(AnalyzerState::Stopped);
        false
    }
}

enum ConnectedOutcome {
    StoppedByCommand,
    Crashed(String),
}

#[allow(clippy::too_many_arguments)]
async fn run_connected(
    cmd_rx: &mut mpsc::Receiver<ActorCommand>,
    writer: &mut tokio::process::ChildStdin,
    reader: &mut BufReader<tokio::process::ChildStdout>,
    config: &AnalyzerConfig,
    req_ids: &RequestIdGen,
    sink: &mut Option<Sink>,
    child: &mut Child,
) -> ConnectedOutcome {
    let mut pending: HashMap<i64, oneshot::Sender<Result<Value, ProxyError>>> = HashMap::new();
    let mut idle_deadline = Instant::now() + config.idle_timeout;

    loop {
        let sleep = tokio::time::sleep_until(idle_deadline);
        tokio::pin!(sleep);

        tokio::select! {
            biased;

            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(ActorCommand::SendRequest { method, params, reply }) => {
                        let id = req_ids.next();
                        let msg = json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "method": method,
                            "params": params,
                        });
                        if let Err(e) = write_framed_message(writer, &msg).await {
                            let _ = reply.send(Err(e));
                            return ConnectedOutcome::Crashed("stdin write failed".to_string());
                        }
                        pending.insert(id, reply);
                        idle_deadline = Instant::now() + config.idle_timeout;
                    }
                    Some(ActorCommand::SendNotification { method, params }) => {
                        let msg = json!({ "jsonrpc": "2.0", "method": method, "params": params });
                        if write_framed_message(writer, &msg).await.is_err() {
                            return ConnectedOutcome::Crashed("stdin write failed".to_string());
                        }
                        idle_deadline = Instant::now() + config.idle_timeout;
                    }
                    Some(ActorCommand::Rebind { sink: new_sink }) => {
                        *sink = Some(new_sink);
                    }
                    Some(ActorCommand::Stop) | None => {
                        fail_all_pending(&mut pending, "analyzer stopping");
                        return ConnectedOutcome::StoppedByCommand;
                    }
                }
            }

            read_result = read_framed_message(reader) => {
                match read_result {
                    Ok(Some(value)) => {
                        dispatch_incoming(value, &mut pending, sink);
                    }
                    Ok(None) => {
                        fail_all_pending(&mut pending, "analyzer stdout closed");
                        return ConnectedOutcome::Crashed("stdout closed".to_string());
                    }
                    Err(e) => {
                        fail_all_pending(&mut pending, "analyzer framing error");
                        return ConnectedOutcome::Crashed(format!("framing error: {e}"));
                    }
                }
            }

            _ = &mut sleep => {
                info!(language = %config.language_id, "analyzer idle timeout — stopping");
                fail_all_pending(&mut pending, "analyzer stopping (idle)");
                return ConnectedOutcome::StoppedByCommand;
            }

            status = child.wait() => {
                let status = status.map(|s| s.to_string()).unwrap_or_else(|e| e.to_string());
                fail_all_pending(&mut pending, "analyzer process exited");
                return ConnectedOutcome::Crashed(format!("process exited: {status}"));
            }
        }
    }
}

fn fail_all_pending(
    pending: &mut HashMap<i64, oneshot::Sender<Result<Value, ProxyError>>>,
    reason: &str,
) {
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(ProxyError::AnalyzerCrashed(reason.to_string())));
    }
}

fn dispatch_incoming(
    value: Value,
    pending: &mut HashMap<i64, oneshot::Sender<Result<Value, ProxyError>>>,
    sink: &mut Option<Sink>,
) {
    if let Some(id) = value.get("id").and_then(Value::as_i64) {
        if value.get("method").is_none() {
            // A response to one of our outbound requests.
            if let Some(reply) = pending.remove(&id) {
                if let Some(error) = value.get("error") {
                    let message = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("analyzer error")
                        .to_string();
                    let _ = reply.send(Err(ProxyError::Transport(message)));
                } else {
                    let _ = reply.send(Ok(value.get("result").cloned().unwrap_or(Value::Null)));
                }
            }
            // else: late response to an already-cancelled/restarted request — dropped.
            return;
        }
    }

    if value.get("method").is_some() && value.get("id").is_none() {
        // Server-initiated notification — forward to the bound sink.
        if let Some(sink) = sink.as_ref() {
            let _ = sink.send(value);
        }
        return;
    }

    // Server-initiated request (e.g. workspace/configuration). Not handled
    // by this core; logged so an operator can see the analyzer is asking
    // for something the proxy doesn't answer.
    if let Some(method) = value.get("method").and_then(Value::as_str) {
        debug!(method, "ignoring server-initiated request");
    }
}

fn spawn_child(config: &AnalyzerConfig) -> ProxyResult<Child> {
    ProcessCommand::new(&config.command)
        .args(&config.args)
        .current_dir(&config.workspace_root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ProxyError::AnalyzerUnavailable {
            language: config.language_id.clone(),
            reason: format!("failed to start '{}': {e}", config.command),
        })
}

async fn initialize_handshake(
    writer: &mut tokio::process::ChildStdin,
    reader: &mut BufReader<tokio::process::ChildStdout>,
    config: &AnalyzerConfig,
    req_ids: &RequestIdGen,
) -> ProxyResult<()> {
    // Matches the format `proxy::rewrite::to_analyzer` builds for document
    // URIs, so a document handed to this analyzer always resolves under the
    // `rootUri`/`workspaceFolders` declared here.
    let root_uri = format!("file://{}", path_to_forward_slash(&config.workspace_root));
    let id = req_ids.next();
    let init_request = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "initialize",
        "params": {
            "processId": std::process::id(),
            "rootUri": root_uri,
            "capabilities": client_capabilities(),
            "workspaceFolders": [{ "uri": root_uri, "name": "workspace" }],
        }
    });
    write_framed_message(writer, &init_request).await?;

    loop {
        let value = read_framed_message(reader)
            .await?
            .ok_or_else(|| ProxyError::Transport("analyzer closed stdout during initialize".to_string()))?;
        if value.get("id").and_then(Value::as_i64) == Some(id) {
            if value.get("error").is_some() {
                return Err(ProxyError::AnalyzerUnavailable {
                    language: config.language_id.clone(),
                    reason: "initialize returned an error".to_string(),
                });
            }
            break;
        }
        // Ignore any notifications the analyzer sends before replying.
    }

    let initialized = json!({ "jsonrpc": "2.0", "method": "initialized", "params": {} });
    write_framed_message(writer, &initialized).await?;
    Ok(())
}

/// Client capabilities declared on `initialize`.
fn client_capabilities() -> Value {
    json!({
        "textDocument": {
            "hover": { "contentFormat": ["markdown", "plaintext"] },
            "completion": {
                "completionItem": { "snippetSupport": true }
            },
            "definition": { "linkSupport": true },
            "references": {},
            "documentSymbol": { "hierarchicalDocumentSymbolSupport": true },
            "publishDiagnostics": { "relatedInformation": true },
            "formatting": {},
        },
        "workspace": {
            "workspaceFolders": true,
        }
    })
}

async fn shutdown_gracefully(
    writer: &mut tokio::process::ChildStdin,
    child: &mut Child,
    grace_period: Duration,
) {
    let shutdown = json!({ "jsonrpc": "2.0", "id": 0, "method": "shutdown", "params": null });
    let _ = write_framed_message(writer, &shutdown).await;
    let exit = json!({ "jsonrpc": "2.0", "method": "exit", "params": null });
    let _ = write_framed_message(writer, &exit).await;

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}
