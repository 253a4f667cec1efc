//! Error taxonomy for the proxy core.
//!
//! Every handler-facing error eventually becomes either a JSON-RPC error
//! reply (for requests) or a log line (for notifications) — never a raw
//! `Debug` dump of an internal type.

use thiserror::Error;

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
#[allow(dead_code)]
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed JSON-RPC framing, or a request missing `method`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An LSP method this proxy does not implement.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// `params.textDocument.uri` refers to a URI the workspace has no record of.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// A path argument resolved outside the workspace root.
    #[error("security error: {0}")]
    Security(String),

    /// No analyzer is configured for a language, or its restart budget was
    /// exhausted.
    #[error("analyzer unavailable for {language}: {reason}")]
    AnalyzerUnavailable { language: String, reason: String },

    /// The analyzer for this language crashed; the in-flight request was
    /// failed as a side effect.
    #[error("analyzer crashed: {0}")]
    AnalyzerCrashed(String),

    /// The WebSocket or analyzer-stdio stream itself failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// Catch-all for I/O and (de)serialization failures that don't fit a
    /// more specific kind above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ProxyError {
    /// Translate to a `(code, message)` pair suitable for a JSON-RPC error
    /// object. Never leaks a raw `Debug` representation of an internal type.
    pub fn to_rpc_error(&self) -> (i32, String) {
        match self {
            ProxyError::Protocol(msg) => (INVALID_REQUEST, msg.clone()),
            ProxyError::MethodNotFound(method) => {
                (METHOD_NOT_FOUND, format!("method not found: {method}"))
            }
            ProxyError::DocumentNotFound(uri) => {
                (INTERNAL_ERROR, format!("document not found: {uri}"))
            }
            ProxyError::Security(msg) => (INTERNAL_ERROR, msg.clone()),
            ProxyError::AnalyzerUnavailable { language, reason } => (
                INTERNAL_ERROR,
                format!("analyzer unavailable for {language}: {reason}"),
            ),
            ProxyError::AnalyzerCrashed(msg) => (INTERNAL_ERROR, msg.clone()),
            ProxyError::Transport(msg) => (INTERNAL_ERROR, msg.clone()),
            ProxyError::Other(err) => (INTERNAL_ERROR, err.to_string()),
        }
    }
}

pub type ProxyResult<T> = Result<T, ProxyError>;
