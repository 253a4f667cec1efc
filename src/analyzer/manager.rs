//! Registry of running analyzer entries keyed by `languageId` — exactly one
//! analyzer process per distinct language identifier, shared across all
//! sessions/documents of that language.
//!
//! Concurrent `get_or_spawn` calls for the same language must coalesce into a
//! single spawn rather than racing two child processes into existence. Built
//! on `tokio::sync::OnceCell` per slot so the second caller simply awaits the
//! first caller's in-flight spawn instead of retrying it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OnceCell, RwLock};
use tracing::info;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};

use super::process::{spawn_analyzer, AnalyzerConfig, AnalyzerHandle, AnalyzerState};

type Slot = Arc<OnceCell<ProxyResult<Arc<AnalyzerHandle>>>>;

pub struct AnalyzerManager {
    config: Arc<Config>,
    slots: RwLock<HashMap<String, Slot>>,
}

#[derive(Debug, Serialize)]
pub struct AnalyzerSnapshot {
    pub language_id: String,
    pub state: String,
    pub pid: Option<u32>,
}

impl AnalyzerManager {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            slots: RwLock::new(HashMap::new()),
        }
    }

    /// Return the running analyzer for `language_id`, spawning it on first
    /// use. Concurrent callers for the same language share one spawn.
    pub async fn get_or_spawn(&self, language_id: &str) -> ProxyResult<Arc<AnalyzerHandle>> {
        let slot = {
            let slots = self.slots.read().await;
            slots.get(language_id).cloned()
        };

        let slot = match slot {
            Some(slot) => slot,
            None => {
                let mut slots = self.slots.write().await;
                slots
                    .entry(language_id.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            }
        };

        let result = slot
            .get_or_init(|| self.spawn(language_id))
            .await;

        match result {
            Ok(handle) => {
                if handle.state() == AnalyzerState::Stopped {
                    // A previously spawned analyzer exhausted its restart
                    // budget and gave up; clear the slot so the next call
                    // spawns fresh rather than returning a dead handle
                    // forever.
                    self.slots.write().await.remove(language_id);
                    return Err(ProxyError::AnalyzerUnavailable {
                        language: language_id.to_string(),
                        reason: "analyzer previously stopped and exhausted its restart budget"
                            .to_string(),
                    });
                }
                Ok(handle.clone())
            }
            Err(e) => {
                self.slots.write().await.remove(language_id);
                Err(clone_proxy_error(e))
            }
        }
    }

    async fn spawn(&self, language_id: &str) -> ProxyResult<Arc<AnalyzerHandle>> {
        let (command, args) = self.config.analyzer_command(language_id).ok_or_else(|| {
            ProxyError::AnalyzerUnavailable {
                language: language_id.to_string(),
                reason: "no analyzer configured for this language".to_string(),
            }
        })?;

        info!(language = language_id, command = %command, "spawning analyzer");

        let analyzer_config = AnalyzerConfig {
            language_id: language_id.to_string(),
            command,
            args,
            workspace_root: self.config.workspace_root.clone(),
            init_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
            stop_grace_period: Duration::from_secs(2),
            restart_budget: self.config.restart_budget,
            restart_window: Duration::from_secs(self.config.restart_window_secs),
        };

        spawn_analyzer(analyzer_config).await.map(Arc::new)
    }

    pub async fn stop(&self, language_id: &str) {
        let slot = { self.slots.write().await.remove(language_id) };
        if let Some(slot) = slot {
            if let Some(Ok(handle)) = slot.get() {
                handle.stop().await;
            }
        }
    }

    pub async fn stop_all(&self) {
        let slots = { std::mem::take(&mut *self.slots.write().await) };
        for (language_id, slot) in slots {
            if let Some(Ok(handle)) = slot.get() {
                info!(language = %language_id, "stopping analyzer");
                handle.stop().await;
            }
        }
    }

    pub async fn snapshot(&self) -> Vec<AnalyzerSnapshot> {
        let slots = self.slots.read().await;
        let mut out = Vec::with_capacity(slots.len());
        for (language_id, slot) in slots.iter() {
            if let Some(Ok(handle)) = slot.get() {
                out.push(AnalyzerSnapshot {
                    language_id: language_id.clone(),
                    state: format!("{:?}", handle.state()),
                    pid: handle.pid(),
                });
            }
        }
        out
    }
}

fn clone_proxy_error(e: &ProxyError) -> ProxyError {
    match e {
        ProxyError::AnalyzerUnavailable { language, reason } => ProxyError::AnalyzerUnavailable {
            language: language.clone(),
            reason: reason.clone(),
        },
        other => ProxyError::Other(anyhow::anyhow!(other.to_string())),
    }
}
