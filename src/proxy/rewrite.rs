//! URI rewriting seam between the browser-facing URI space and the
//! analyzer-facing one.
//!
//! Client-space URIs are workspace-root-relative (`file:///<relative>`, the
//! wire form spec.md §6 documents); the analyzer subprocess is started with
//! its `rootUri`/`workspaceFolders` set to the real absolute workspace root
//! (see `analyzer::process::initialize_handshake`), so every document URI
//! handed to it — and every URI it reports back in a response or
//! notification — has to be the real absolute `file://<workspace_root>/...`
//! form instead. These two functions are the single place that translation
//! happens.

use std::path::{Path, PathBuf};

use crate::security::{normalize_path, path_to_forward_slash, strip_uri_scheme};

/// Client URI (root-relative) -> absolute URI the analyzer subprocess sees.
pub fn to_analyzer(client_uri: &str, workspace_root: &Path) -> String {
    let relative = strip_uri_scheme(client_uri);
    let absolute = normalize_path(&workspace_root.join(relative));
    format!("file://{}", path_to_forward_slash(&absolute))
}

/// URI as reported by an analyzer (e.g. in `publishDiagnostics` or a
/// `definition` result) -> URI to forward back to the client. A URI outside
/// the workspace root (a reference into the language's standard library or
/// an installed dependency, say) is passed through unchanged — the client
/// has no root-relative name for it anyway.
pub fn to_client(analyzer_uri: &str, workspace_root: &Path) -> String {
    let Some(path) = file_uri_to_path(analyzer_uri) else {
        return analyzer_uri.to_string();
    };
    let normalized = normalize_path(&path);
    match normalized.strip_prefix(workspace_root) {
        Ok(relative) => format!("file:///{}", path_to_forward_slash(relative)),
        Err(_) => analyzer_uri.to_string(),
    }
}

fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    let path = uri.strip_prefix("file://")?;
    Some(PathBuf::from(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_analyzer_joins_client_uri_onto_the_workspace_root() {
        let root = Path::new("/tmp/ws");
        assert_eq!(to_analyzer("file:///main.go", root), "file:///tmp/ws/main.go");
    }

    #[test]
    fn to_analyzer_handles_nested_paths() {
        let root = Path::new("/tmp/ws");
        assert_eq!(
            to_analyzer("file:///src/pkg/main.go", root),
            "file:///tmp/ws/src/pkg/main.go"
        );
    }

    #[test]
    fn to_client_strips_the_workspace_root_back_off() {
        let root = Path::new("/tmp/ws");
        assert_eq!(to_client("file:///tmp/ws/main.go", root), "file:///main.go");
    }

    #[test]
    fn to_client_passes_through_uris_outside_the_workspace_root() {
        let root = Path::new("/tmp/ws");
        let external = "file:///usr/lib/go/src/fmt/print.go";
        assert_eq!(to_client(external, root), external);
    }

    #[test]
    fn to_client_passes_through_non_file_uris_untouched() {
        let root = Path::new("/tmp/ws");
        let untitled = "untitled:Untitled-1";
        assert_eq!(to_client(untitled, root), untitled);
    }

    #[test]
    fn round_trips_through_both_directions() {
        let root = Path::new("/tmp/ws");
        let client_uri = "file:///src/main.go";
        let analyzer_uri = to_analyzer(client_uri, root);
        assert_eq!(to_client(&analyzer_uri, root), client_uri);
    }
}
