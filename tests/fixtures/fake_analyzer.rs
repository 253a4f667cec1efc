//! Standalone stand-in for `gopls`/`typescript-language-server`, built as an
//! extra `[[bin]]` so integration tests can spawn a real child process over
//! real stdio pipes instead of mocking `tokio::process::Command`.
//!
//! Speaks just enough `Content-Length`-framed JSON-RPC to answer
//! `initialize`/`shutdown`, echo a diagnostic on `didOpen`, and answer
//! `textDocument/completion` with a fixed item list. Behavior knobs are read
//! from the environment so each test can shape a distinct scenario without a
//! distinct binary:
//!
//! - `FAKE_ANALYZER_FAIL_INIT=1` — reply to `initialize` with a JSON-RPC
//!   error, so the caller's handshake fails.
//! - `FAKE_ANALYZER_CRASH_AFTER_INIT=1` — exit the process immediately after
//!   the `initialize`/`initialized` handshake completes, on every spawn.
//! - `FAKE_ANALYZER_CRASH_COUNTER_FILE=<path>` — exit right after the
//!   handshake as above, but only while the file at `<path>` contains a
//!   value > 0; each crashing spawn decrements it by one. Lets a test seed
//!   "crash N times then behave" to exercise crash-restart recovery rather
//!   than only budget exhaustion.

use std::io::{self, BufRead, BufReader, Read, Write};

fn should_crash_after_init() -> bool {
    if std::env::var("FAKE_ANALYZER_CRASH_AFTER_INIT").is_ok() {
        return true;
    }
    let Ok(path) = std::env::var("FAKE_ANALYZER_CRASH_COUNTER_FILE") else {
        return false;
    };
    let remaining: i64 = std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    if remaining > 0 {
        let _ = std::fs::write(&path, (remaining - 1).to_string());
        true
    } else {
        false
    }
}

fn main() {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let stdout = io::stdout();
    let mut writer = stdout.lock();

    let fail_init = std::env::var("FAKE_ANALYZER_FAIL_INIT").is_ok();
    let crash_after_init = should_crash_after_init();

    loop {
        let Some(msg) = read_message(&mut reader) else {
            return;
        };

        let method = msg.get("method").and_then(|m| m.as_str());
        let id = msg.get("id").cloned();

        match method {
            Some("initialize") => {
                if fail_init {
                    write_message(
                        &mut writer,
                        &serde_json::json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32603, "message": "fake analyzer: forced init failure" }
                        }),
                    );
                    return;
                }
                write_message(
                    &mut writer,
                    &serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": { "capabilities": {} }
                    }),
                );
            }
            Some("initialized") => {
                if crash_after_init {
                    std::process::exit(1);
                }
            }
            Some("textDocument/didOpen") => {
                let uri = msg
                    .pointer("/params/textDocument/uri")
                    .and_then(|u| u.as_str())
                    .unwrap_or("file:///unknown");
                write_message(
                    &mut writer,
                    &serde_json::json!({
                        "jsonrpc": "2.0",
                        "method": "textDocument/publishDiagnostics",
                        "params": {
                            "uri": uri,
                            "diagnostics": [{
                                "range": {
                                    "start": { "line": 0, "character": 0 },
                                    "end": { "line": 0, "character": 1 }
                                },
                                "severity": 2,
                                "message": "fake analyzer: unused variable"
                            }]
                        }
                    }),
                );
            }
            Some("textDocument/completion") => {
                write_message(
                    &mut writer,
                    &serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": [
                            { "label": "Println", "kind": 3 },
                            { "label": "Printf", "kind": 3 }
                        ]
                    }),
                );
            }
            Some("textDocument/didClose") => {
                // No reply is expected by real LSP servers either; emit a
                // notification so tests can observe that `didClose` actually
                // reached the analyzer without needing a request/response.
                let uri = msg
                    .pointer("/params/textDocument/uri")
                    .and_then(|u| u.as_str())
                    .unwrap_or("file:///unknown");
                write_message(
                    &mut writer,
                    &serde_json::json!({
                        "jsonrpc": "2.0",
                        "method": "test/didCloseReceived",
                        "params": { "uri": uri }
                    }),
                );
            }
            Some("shutdown") => {
                write_message(
                    &mut writer,
                    &serde_json::json!({ "jsonrpc": "2.0", "id": id, "result": null }),
                );
            }
            Some("exit") => {
                return;
            }
            Some(other) if id.is_some() => {
                // Unrecognized request: answer with method-not-found rather
                // than hanging the caller's await forever.
                write_message(
                    &mut writer,
                    &serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "error": { "code": -32601, "message": format!("fake analyzer: unhandled method {other}") }
                    }),
                );
            }
            _ => {
                // Unrecognized notification: ignored.
            }
        }
    }
}

fn read_message<R: BufRead>(reader: &mut R) -> Option<serde_json::Value> {
    let mut content_length: Option<usize> = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some(value) = trimmed.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }
    let length = content_length?;
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).ok()?;
    serde_json::from_slice(&body).ok()
}

fn write_message<W: Write>(writer: &mut W, value: &serde_json::Value) {
    let body = serde_json::to_vec(value).expect("serializable message");
    let _ = write!(writer, "Content-Length: {}\r\n\r\n", body.len());
    let _ = writer.write_all(&body);
    let _ = writer.flush();
}
