//! Proxy session state machine: per-connection LSP routing, per-URI
//! serialization, and URI rewriting between client and analyzer space.

mod content_sync;
mod rewrite;
mod session;
mod uri_lock;

pub use session::{ClientSink, ProxySession};
