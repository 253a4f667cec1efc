//! Lifecycle supervisor: loads configuration, wires the workspace store,
//! analyzer manager, and transport server together, then drives graceful
//! shutdown on SIGTERM/Ctrl-C with a hard-kill deadline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use lsp_bridge::transport::{self, AppContext};
use lsp_bridge::{analyzer::AnalyzerManager, workspace::WorkspaceStore, Config};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Wall-clock budget for "refuse new connections → stopAll analyzers → close
/// existing sessions" before the process gives up on a clean exit and kills
/// itself.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Logging init must happen before any tracing call anywhere else in the
    // process.
    let _log_guard = setup_logging(&config.log_level, config.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "lsp-bridge starting");
    info!(
        port = config.port,
        workspace = %config.workspace_root.display(),
        idle_timeout_secs = config.idle_timeout_secs,
        restart_budget = config.restart_budget,
        "config loaded"
    );

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "failed to create workspace root {}: {e}",
                config.workspace_root.display()
            )
        })?;

    let config = Arc::new(config);
    let workspace = Arc::new(WorkspaceStore::new(config.workspace_root.clone()));
    let analyzers = Arc::new(AnalyzerManager::new(config.clone()));
    let ctx = Arc::new(AppContext {
        config: config.clone(),
        workspace,
        analyzers: analyzers.clone(),
        started_at: Instant::now(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(transport::run(ctx.clone(), shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received — beginning graceful shutdown");

    let exit_code = run_graceful_shutdown(shutdown_tx, server, analyzers).await;
    info!(uptime_secs = ctx.started_at.elapsed().as_secs(), "lsp-bridge exiting");
    std::process::exit(exit_code);
}

/// Drives the shutdown sequence — stop accepting connections, drain sessions
/// (which send `didClose` for their open documents), then stop every
/// analyzer — inside a hard wall-clock deadline. Session draining happens
/// before stopping analyzers so outgoing `didClose` notifications still
/// have a live analyzer to reach; see DESIGN.md for the reasoning.
async fn run_graceful_shutdown(
    shutdown_tx: watch::Sender<bool>,
    server: tokio::task::JoinHandle<Result<()>>,
    analyzers: Arc<AnalyzerManager>,
) -> i32 {
    let _ = shutdown_tx.send(true);

    let sequence = async {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(err = %e, "transport server returned an error during shutdown"),
            Err(e) => error!(err = %e, "transport server task panicked"),
        }
        analyzers.stop_all().await;
    };

    match tokio::time::timeout(SHUTDOWN_DEADLINE, sequence).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            0
        }
        Err(_) => {
            warn!(
                deadline_secs = SHUTDOWN_DEADLINE.as_secs(),
                "shutdown deadline expired — exiting without full drain"
            );
            1
        }
    }
}

/// Resolves on SIGTERM (Unix) or Ctrl-C (all platforms).
async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to register SIGTERM handler, falling back to Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Initialize the tracing subscriber. If `log_file` is set, logs go to both
/// stdout and a daily-rolling file. Returns a `WorkerGuard` that must stay
/// alive for the process lifetime — dropping it early silently stops the
/// non-blocking file writer from flushing.
///
/// Falls back to stdout-only logging (with a `warn!` once the subscriber is
/// up) if the log directory can't be created — never panics on a bad log
/// path.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("lsp-bridge.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        warn!(dir = %dir.display(), err = %e, "could not create log directory, falling back to stdout-only logging");
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
        .init();

    Some(guard)
}
