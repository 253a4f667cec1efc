//! `lsp-bridge` — a browser-facing Language Server Protocol proxy.
//!
//! Multiplexes many WebSocket-connected editor clients onto a small pool of
//! per-language analyzer subprocesses (`gopls`, `typescript-language-server`,
//! …), owning the on-disk workspace those analyzers and clients both operate
//! on. See `DESIGN.md` for the module map and the reasoning behind it.

pub mod analyzer;
pub mod codec;
pub mod config;
pub mod error;
pub mod proxy;
pub mod security;
pub mod transport;
pub mod workspace;

pub use config::Config;
pub use error::{ProxyError, ProxyResult};
pub use transport::AppContext;
