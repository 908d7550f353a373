//! Core data models used throughout Code Harness.
//!
//! These types represent the chunks, index requests, and search results
//! that flow through the indexing pipeline and the retrieval engine.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Revision label stored on chunks indexed from the working tree.
pub const WORKTREE_REV: &str = "worktree";
/// Revision label stored on chunks indexed from the staging area.
pub const STAGED_REV: &str = "staged";

/// Identity of a VCS tree snapshot (a git tree object id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TreeId(pub String);

impl TreeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which state of the repository an index run targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "rev")]
pub enum SyncMode {
    /// Files as they currently are on disk (tracked + untracked, minus ignored).
    Worktree,
    /// The contents of the staging area.
    Staged,
    /// An explicit commit-ish (`HEAD`, a branch, a sha).
    Revision(String),
}

impl SyncMode {
    /// Parse the form persisted in [`RepoState`](crate::state::RepoState).
    pub fn parse(s: &str) -> Self {
        match s {
            "worktree" => Self::Worktree,
            "staged" => Self::Staged,
            other => Self::Revision(other.strip_prefix("rev:").unwrap_or(other).to_string()),
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Worktree => f.write_str("worktree"),
            Self::Staged => f.write_str("staged"),
            Self::Revision(rev) => write!(f, "rev:{rev}"),
        }
    }
}

/// Kind of change reported by a tree diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
    Renamed,
}

/// A single file-level change between two trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub status: ChangeStatus,
    /// Path in the target tree (or the removed path for deletions).
    pub path: String,
    /// Previous path, set only for renames.
    pub old_path: Option<String>,
}

impl FileChange {
    pub fn new(status: ChangeStatus, path: impl Into<String>) -> Self {
        Self {
            status,
            path: path.into(),
            old_path: None,
        }
    }

    pub fn renamed(old_path: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            status: ChangeStatus::Renamed,
            path: path.into(),
            old_path: Some(old_path.into()),
        }
    }
}

/// One indexed, searchable slice of a source file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Hash of (project_id, path, start_line, end_line).
    pub id: String,
    pub project_id: String,
    /// Repository-relative path with `/` separators.
    pub path: String,
    pub lang: String,
    /// Symbol name for structure-derived chunks; `None` for line windows.
    pub symbol: Option<String>,
    /// 1-indexed, inclusive.
    pub start_line: u32,
    /// 1-indexed, inclusive.
    pub end_line: u32,
    pub content: String,
    pub content_hash: String,
    pub file_hash: String,
    pub tree_sha: String,
    /// Commit id, `"staged"`, or `"worktree"`.
    pub rev: String,
}

/// A chunk proposed by a [`Chunker`](crate::chunk::Chunker) before the
/// pipeline assigns identity and provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCandidate {
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub symbol: Option<String>,
    pub lang: String,
}

/// Input to [`IndexPipeline::run`](crate::pipeline::IndexPipeline::run).
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub repo_root: PathBuf,
    pub mode: SyncMode,
    /// Glob filters over repository-relative paths; a file matching any of
    /// them is in scope. Empty means no filtering.
    pub paths: Vec<String>,
    pub force_reindex: bool,
}

impl IndexRequest {
    pub fn new(repo_root: impl Into<PathBuf>, mode: SyncMode) -> Self {
        Self {
            repo_root: repo_root.into(),
            mode,
            paths: Vec::new(),
            force_reindex: false,
        }
    }

    pub fn with_paths(mut self, paths: Vec<String>) -> Self {
        self.paths = paths;
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force_reindex = force;
        self
    }
}

/// Outcome of an indexing run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexResponse {
    pub success: bool,
    pub files_indexed: u64,
    pub chunks_created: u64,
    pub chunks_updated: u64,
    pub chunks_deleted: u64,
    pub vectors_stored: u64,
    pub files_failed: u64,
    pub tree_sha: Option<String>,
    pub incremental: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl IndexResponse {
    /// A failed run: counters stay zero, `error` is populated.
    pub fn failed(error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            duration_ms,
            ..Self::default()
        }
    }
}

/// A search query.
#[derive(Debug, Clone)]
pub struct Query {
    pub text: String,
    pub limit: usize,
    /// Glob over repository-relative paths, applied inside both indexes.
    pub path_filter: Option<String>,
    /// Exact language match, applied after chunk resolution.
    pub lang: Option<String>,
}

impl Query {
    pub fn new(text: impl Into<String>, limit: usize) -> Self {
        Self {
            text: text.into(),
            limit,
            path_filter: None,
            lang: None,
        }
    }

    pub fn with_path_filter(mut self, glob: impl Into<String>) -> Self {
        self.path_filter = Some(glob.into());
        self
    }

    pub fn with_lang(mut self, lang: impl Into<String>) -> Self {
        self.lang = Some(lang.into());
        self
    }
}

/// Per-list scores behind a fused result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreExplanation {
    /// Raw lexical (BM25) score; 0.0 if absent from the lexical list.
    pub bm25_score: f64,
    /// Raw vector similarity; 0.0 if absent from the vector list.
    pub vector_score: f64,
    /// Reciprocal rank fusion score.
    pub fused_score: f64,
}

/// A ranked, explained search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk: Chunk,
    pub score: f64,
    /// 1-indexed.
    pub rank: usize,
    pub preview: String,
    pub explanation: ScoreExplanation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_mode_display_parse() {
        for mode in [
            SyncMode::Worktree,
            SyncMode::Staged,
            SyncMode::Revision("HEAD~1".into()),
        ] {
            assert_eq!(SyncMode::parse(&mode.to_string()), mode);
        }
    }

    #[test]
    fn failed_response_has_zero_counters() {
        let resp = IndexResponse::failed("boom", 7);
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("boom"));
        assert_eq!(resp.files_indexed, 0);
        assert_eq!(resp.chunks_created, 0);
        assert_eq!(resp.vectors_stored, 0);
        assert!(resp.tree_sha.is_none());
    }

    #[test]
    fn index_response_serializes_without_null_error() {
        let resp = IndexResponse {
            success: true,
            files_indexed: 2,
            tree_sha: Some("abc".into()),
            ..IndexResponse::default()
        };
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["files_indexed"], 2);
        assert_eq!(json["tree_sha"], "abc");
        assert!(json.get("error").is_none());
    }
}
