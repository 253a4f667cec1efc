//! Daemon configuration — environment variables loaded once at startup via
//! `clap`. CLI flags take priority over the environment, which takes
//! priority over the built-in default.

use std::path::PathBuf;

use clap::Parser;

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/tmp/online-editor")
}

#[derive(Debug, Clone, Parser)]
#[command(
    name = "lsp-bridged",
    about = "Browser-facing language-server proxy",
    version
)]
pub struct Config {
    /// HTTP + WebSocket listen port.
    #[arg(long, env = "PORT", default_value_t = 3001)]
    pub port: u16,

    /// Absolute root directory the workspace store is confined to.
    #[arg(long, env = "WORKSPACE_ROOT", default_value = "/tmp/online-editor")]
    pub workspace_root: PathBuf,

    /// `go` analyzer binary.
    #[arg(long, env = "GOPLS_PATH", default_value = "gopls")]
    pub gopls_path: String,

    /// `typescript`/`javascript` analyzer binary.
    #[arg(long, env = "TS_SERVER_PATH", default_value = "typescript-language-server")]
    pub ts_server_path: String,

    /// One of `error|warning|info|debug`.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Allowed origin for the (external) HTTP surface — recorded and
    /// surfaced via `/health`, not enforced by the core.
    #[arg(long, env = "CORS_ORIGIN", default_value = "http://localhost:3000")]
    pub cors_origin: String,

    /// Idle-shutdown window per analyzer.
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Maximum single WebSocket frame size, in bytes.
    #[arg(long, env = "MAX_FRAME_BYTES", default_value_t = 16 * 1024 * 1024)]
    pub max_frame_bytes: usize,

    /// Maximum analyzer restarts allowed within `restart_window_secs`.
    #[arg(long, env = "RESTART_BUDGET", default_value_t = 3)]
    pub restart_budget: u32,

    /// Sliding window, in seconds, over which `restart_budget` is enforced.
    #[arg(long, env = "RESTART_WINDOW_SECS", default_value_t = 60)]
    pub restart_window_secs: u64,

    /// Write logs to this file (daily-rolling) in addition to stdout.
    #[arg(long, env = "LSP_BRIDGE_LOG_FILE")]
    pub log_file: Option<PathBuf>,

    /// HTTP path the WebSocket LSP transport upgrades on.
    #[arg(long, env = "LSP_WS_PATH", default_value = "/lsp")]
    pub ws_path: String,
}

impl Config {
    /// `gopls`/`typescript-language-server` command + args for a given
    /// `languageId`, or `None` if the language has no configured analyzer.
    pub fn analyzer_command(&self, language_id: &str) -> Option<(String, Vec<String>)> {
        match language_id {
            "go" => Some((self.gopls_path.clone(), vec![])),
            "typescript" | "javascript" => {
                Some((self.ts_server_path.clone(), vec!["--stdio".to_string()]))
            }
            _ => None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3001,
            workspace_root: default_workspace_root(),
            gopls_path: "gopls".to_string(),
            ts_server_path: "typescript-language-server".to_string(),
            log_level: "info".to_string(),
            cors_origin: "http://localhost:3000".to_string(),
            idle_timeout_secs: 300,
            max_frame_bytes: 16 * 1024 * 1024,
            restart_budget: 3,
            restart_window_secs: 60,
            log_file: None,
            ws_path: "/lsp".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analyzer_command_maps_go() {
        let cfg = Config::default();
        let (cmd, args) = cfg.analyzer_command("go").unwrap();
        assert_eq!(cmd, "gopls");
        assert!(args.is_empty());
    }

    #[test]
    fn analyzer_command_maps_typescript_and_javascript_to_same_server() {
        let cfg = Config::default();
        let (ts_cmd, ts_args) = cfg.analyzer_command("typescript").unwrap();
        let (js_cmd, js_args) = cfg.analyzer_command("javascript").unwrap();
        assert_eq!(ts_cmd, js_cmd);
        assert_eq!(ts_args, js_args);
        assert_eq!(ts_args, vec!["--stdio"]);
    }

    #[test]
    fn analyzer_command_unknown_language_is_none() {
        let cfg = Config::default();
        assert!(cfg.analyzer_command("cobol").is_none());
    }
}
