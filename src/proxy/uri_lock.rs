//! Per-URI FIFO lock: operations on the same document URI are applied in the
//! order they are received; concurrent operations on different URIs proceed
//! independently.
//!
//! Built as a registry of refcounted `tokio::sync::Mutex`es rather than a
//! single global lock, so two sessions editing different files never
//! contend with each other — a keyed-by-id map holding a lock instead of a
//! value, evicted once uncontended. Eviction happens in `UriLockGuard`'s
//! `Drop`, after the per-URI mutex itself has been released, so the
//! refcount check actually observes "nobody else is waiting".

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct UriLockMap {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl UriLockMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the FIFO lock for `uri`. Holding the returned guard guarantees
    /// no other operation on the same URI is in flight; the map entry is
    /// evicted once this is the last outstanding reference to `uri`'s lock
    /// and the guard is dropped.
    pub async fn lock(&self, uri: &str) -> UriLockGuard {
        let entry = {
            let mut locks = self.locks.lock().await;
            locks.entry(uri.to_string()).or_default().clone()
        };
        let guard = entry.lock_owned().await;
        UriLockGuard {
            map: self.locks.clone(),
            uri: uri.to_string(),
            guard: Some(guard),
        }
    }
}

/// RAII guard returned by `UriLockMap::lock`.
pub struct UriLockGuard {
    map: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
    uri: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UriLockGuard {
    fn drop(&mut self) {
        // Release the per-URI mutex itself first — eviction must observe
        // the refcount *after* unlocking, not while this guard's own Arc
        // clone (held inside `guard`) is still alive, or `strong_count`
        // would never see 1 and eviction would never fire.
        self.guard.take();

        if let Ok(mut locks) = self.map.try_lock() {
            if let Some(entry) = locks.get(&self.uri) {
                if Arc::strong_count(entry) == 1 {
                    locks.remove(&self.uri);
                }
            }
        }
        // A failed `try_lock` means another task holds the map lock right
        // now (e.g. a concurrent `lock()` on a different URI); eviction is
        // opportunistic cleanup only, so this cycle is simply skipped — the
        // entry survives to be evicted on some future drop.
    }
}
