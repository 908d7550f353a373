//! Version-control port.
//!
//! The pipeline never touches the working directory directly: it asks a
//! [`Vcs`] for the tree it should index, what changed since the last
//! indexed tree, and the bytes of each file at that tree. The git adapter
//! lives in the app crate; [`memory::MemoryVcs`] is an in-process
//! repository for tests.

pub mod memory;

use anyhow::Result;

use crate::models::{FileChange, SyncMode, TreeId};

/// Read-only view of a repository's trees.
///
/// Tree ids must be content-addressed: two snapshots with identical file
/// contents resolve to the same [`TreeId`], which is what makes a repeated
/// run over an unchanged repository a no-op.
pub trait Vcs: Send + Sync {
    /// Resolve the tree a sync mode refers to right now.
    fn resolve_tree(&self, mode: &SyncMode) -> Result<TreeId>;

    /// Revision label stored on chunks: a commit id, `"staged"`, or
    /// `"worktree"`.
    fn rev_label(&self, mode: &SyncMode) -> Result<String>;

    /// File changes from `from` to `to`. `from = None` lists every file of
    /// `to` as added.
    fn diff(&self, from: Option<&TreeId>, to: &TreeId) -> Result<Vec<FileChange>>;

    /// Every file path in a tree, repository-relative with `/` separators.
    fn list_tracked_files(&self, tree: &TreeId) -> Result<Vec<String>>;

    /// Raw bytes of `path` at `tree`.
    fn read_at(&self, path: &str, tree: &TreeId) -> Result<Vec<u8>>;
}
