//! Workspace store — the only writer of workspace files. Sessions and the
//! analyzer manager only ever touch the filesystem through this type's
//! methods.

pub mod tree;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tokio::sync::RwLock;
use tracing::warn;

use crate::error::{ProxyError, ProxyResult};
use crate::security::{normalize_path, path_to_forward_slash, resolve_under_root, strip_uri_scheme};
use tree::{EntryKind, TreeNode};

#[derive(Debug, Clone)]
pub struct DocMeta {
    pub version: i64,
    pub language_id: String,
}

#[derive(Debug, Clone)]
pub struct DocumentSnapshot {
    pub text: String,
    pub version: i64,
    pub language_id: String,
}

pub struct WorkspaceStore {
    root: PathBuf,
    docs: RwLock<HashMap<String, DocMeta>>,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    // ─── URI ⇄ path ─────────────────────────────────────────────────────────

    /// Extract the path component of a client URI, strip leading separators,
    /// normalize `..`, then join to the root.
    pub fn uri_to_path(&self, uri: &str) -> ProxyResult<PathBuf> {
        let relative = strip_uri_scheme(uri);
        resolve_under_root(&self.root, Path::new(relative))
    }

    /// Emit a `file:///`-style URI with forward slashes, regardless of host
    /// OS path separator conventions.
    pub fn path_to_uri(&self, path: &Path) -> ProxyResult<String> {
        let normalized = normalize_path(path);
        let relative = normalized.strip_prefix(&self.root).map_err(|_| {
            ProxyError::Security(format!(
                "path {} is not inside workspace root {}",
                path.display(),
                self.root.display()
            ))
        })?;
        Ok(format!("file:///{}", path_to_forward_slash(relative)))
    }

    // ─── Document CRUD ──────────────────────────────────────────────────────

    pub async fn create_file(
        &self,
        uri: &str,
        text: &str,
        language_id: &str,
    ) -> ProxyResult<()> {
        let path = self.uri_to_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::Other(e.into()))?;
        }
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| ProxyError::Other(e.into()))?;
        self.docs.write().await.insert(
            uri.to_string(),
            DocMeta {
                version: 1,
                language_id: language_id.to_string(),
            },
        );
        Ok(())
    }

    /// Writes new content and increments the document's version. If `uri`
    /// is untracked, this behaves as create-on-write with version 1 — the
    /// boundary behavior for a `didChange` on a URI the store has never seen.
    pub async fn update_file(&self, uri: &str, text: &str) -> ProxyResult<i64> {
        let path = self.uri_to_path(uri)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::Other(e.into()))?;
        }
        tokio::fs::write(&path, text)
            .await
            .map_err(|e| ProxyError::Other(e.into()))?;

        let mut docs = self.docs.write().await;
        let version = match docs.get_mut(uri) {
            Some(meta) => {
                meta.version += 1;
                meta.version
            }
            None => {
                let language_id = infer_language_id(&path);
                docs.insert(
                    uri.to_string(),
                    DocMeta {
                        version: 1,
                        language_id,
                    },
                );
                1
            }
        };
        Ok(version)
    }

    /// Reads from disk. If `uri` is untracked, infers `languageId` from the
    /// file extension and reports version 1.
    pub async fn read_file(&self, uri: &str) -> ProxyResult<DocumentSnapshot> {
        let path = self.uri_to_path(uri)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| ProxyError::DocumentNotFound(uri.to_string()))?;

        let docs = self.docs.read().await;
        if let Some(meta) = docs.get(uri) {
            Ok(DocumentSnapshot {
                text,
                version: meta.version,
                language_id: meta.language_id.clone(),
            })
        } else {
            Ok(DocumentSnapshot {
                text,
                version: 1,
                language_id: infer_language_id(&path),
            })
        }
    }

    pub async fn delete_file(&self, uri: &str) -> ProxyResult<()> {
        let path = self.uri_to_path(uri)?;
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(ProxyError::Other(e.into()));
            }
        }
        self.docs.write().await.remove(uri);
        Ok(())
    }

    pub async fn has_file(&self, uri: &str) -> ProxyResult<bool> {
        let path = self.uri_to_path(uri)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Last-known in-memory version/languageId, without touching disk.
    pub async fn doc_meta(&self, uri: &str) -> Option<DocMeta> {
        self.docs.read().await.get(uri).cloned()
    }

    // ─── Arbitrary path operations ──────────────────────────────────────────

    pub async fn create_directory(&self, rel_path: &str) -> ProxyResult<()> {
        let path = resolve_under_root(&self.root, Path::new(rel_path))?;
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| ProxyError::Other(e.into()))?;
        Ok(())
    }

    pub async fn delete_path(&self, rel_path: &str) -> ProxyResult<()> {
        let path = resolve_under_root(&self.root, Path::new(rel_path))?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| ProxyError::DocumentNotFound(rel_path.to_string()))?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path)
                .await
                .map_err(|e| ProxyError::Other(e.into()))?;
        } else {
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| ProxyError::Other(e.into()))?;
        }
        Ok(())
    }

    /// Renames a path beneath the root; both the source and destination are
    /// independently checked for escape before anything touches disk.
    /// Transfers any tracked document metadata keyed by the old URI to the
    /// new one.
    pub async fn rename_path(&self, old_rel: &str, new_rel: &str) -> ProxyResult<()> {
        let old_path = resolve_under_root(&self.root, Path::new(old_rel))?;
        let new_path = resolve_under_root(&self.root, Path::new(new_rel))?;

        if let Some(parent) = new_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ProxyError::Other(e.into()))?;
        }
        tokio::fs::rename(&old_path, &new_path)
            .await
            .map_err(|e| ProxyError::Other(e.into()))?;

        let old_uri = self.path_to_uri(&old_path)?;
        let new_uri = self.path_to_uri(&new_path)?;
        let mut docs = self.docs.write().await;
        if let Some(meta) = docs.remove(&old_uri) {
            docs.insert(new_uri, meta);
        }
        Ok(())
    }

    /// Recursive listing rooted at `rel_path`, skipping dotfiles, sorted
    /// directories-first then alphabetically.
    pub async fn list_tree(&self, rel_path: &str) -> ProxyResult<Vec<TreeNode>> {
        let path = resolve_under_root(&self.root, Path::new(rel_path))?;
        self.list_tree_recursive(&path).await
    }

    fn list_tree_recursive<'a>(
        &'a self,
        dir: &'a Path,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ProxyResult<Vec<TreeNode>>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut read_dir = match tokio::fs::read_dir(dir).await {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(ProxyError::Other(e.into())),
            };

            let mut entries = Vec::new();
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| ProxyError::Other(e.into()))?
            {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with('.') {
                    continue;
                }
                let entry_path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(ft) => ft,
                    Err(e) => {
                        warn!(path = %entry_path.display(), err = %e, "skipping unreadable entry");
                        continue;
                    }
                };
                let rel = self.path_to_uri_relative(&entry_path)?;
                if file_type.is_dir() {
                    let children = self.list_tree_recursive(&entry_path).await?;
                    entries.push(TreeNode {
                        name,
                        path: rel,
                        kind: EntryKind::Directory,
                        children: Some(children),
                    });
                } else {
                    entries.push(TreeNode {
                        name,
                        path: rel,
                        kind: EntryKind::File,
                        children: None,
                    });
                }
            }

            entries.sort_by(|a, b| match (a.kind, b.kind) {
                (EntryKind::Directory, EntryKind::File) => std::cmp::Ordering::Less,
                (EntryKind::File, EntryKind::Directory) => std::cmp::Ordering::Greater,
                _ => a.name.cmp(&b.name),
            });

            Ok(entries)
        })
    }

    fn path_to_uri_relative(&self, path: &Path) -> ProxyResult<String> {
        let normalized = normalize_path(path);
        let relative = normalized.strip_prefix(&self.root).map_err(|_| {
            ProxyError::Security(format!(
                "path {} is not inside workspace root {}",
                path.display(),
                self.root.display()
            ))
        })?;
        Ok(path_to_forward_slash(relative))
    }
}

/// Infer `languageId` from a file extension: `.go→go`, `.ts/.tsx→typescript`,
/// `.js/.jsx→javascript`, else `plaintext`.
pub fn infer_language_id(path: &Path) -> String {
    match path.extension().and_then(|e| e.to_str()) {
        Some("go") => "go",
        Some("ts") | Some("tsx") => "typescript",
        Some("js") | Some("jsx") => "javascript",
        _ => "plaintext",
    }
    .to_string()
}
