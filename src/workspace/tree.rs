//! Tree listing types returned by `WorkspaceStore::list_tree`.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

/// A single entry in a workspace-relative directory listing.
#[derive(Debug, Clone, Serialize)]
pub struct TreeNode {
    pub name: String,
    /// Workspace-relative path, forward-slash separated.
    pub path: String,
    pub kind: EntryKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<TreeNode>>,
}
