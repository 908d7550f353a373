//! Incremental indexing pipeline.
//!
//! Coordinates one index run: resolve the target tree → scope it against
//! the last indexed tree → chunk → embed → persist → record the new tree.
//!
//! # Scope
//!
//! | Situation | Files processed | `incremental` |
//! |-----------|-----------------|---------------|
//! | `force_reindex` | every tracked file | `false` |
//! | no previous tree | every tracked file | `false` |
//! | target == previous | none (no-op) | `false` |
//! | otherwise | added / modified / renamed since previous | `true` |
//!
//! Deleted files and the old side of renames are cleaned up. Full runs
//! also sweep chunks left over from older trees.
//!
//! # Per-file atomicity
//!
//! A file's chunks are embedded before anything stored for it is touched,
//! so an embedding failure leaves the file exactly as it was. If storage
//! fails while the file is being replaced, its previous chunks and vectors
//! are restored before the run aborts.
//!
//! # Model changes
//!
//! A forced run under a new embedding model rebuilds the whole index: path
//! filters are ignored, and any vector still tagged with another model
//! afterwards is removed together with its chunk. Every stored vector then
//! carries the fingerprint the run records.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, UNIX_EPOCH};

use futures::stream::{self, StreamExt};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, error, info, warn};

use crate::chunk::{chunk_id, content_hash, project_id, sha256_hex, Chunker};
use crate::embedding::Embedder;
use crate::error::{IndexError, Result};
use crate::lang::{default_extensions, detect_language, extension};
use crate::models::{ChangeStatus, Chunk, IndexRequest, IndexResponse, SyncMode, TreeId};
use crate::state::RepoState;
use crate::store::{
    ChunkRepository, FileRepository, MetaRepository, StoredVector, VectorRepository,
};
use crate::vcs::Vcs;

/// Tunables for [`IndexPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Lowercase extensions (without the dot) eligible for indexing.
    pub extensions: Vec<String>,
    /// Files processed concurrently. `1` is strictly sequential.
    pub max_concurrent_files: usize,
    /// Maximum texts per embedding call.
    pub embed_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            extensions: default_extensions(),
            max_concurrent_files: 1,
            embed_batch_size: 64,
        }
    }
}

/// The incremental indexer.
///
/// All collaborators are injected; the pipeline owns no I/O of its own.
pub struct IndexPipeline {
    vcs: Arc<dyn Vcs>,
    chunker: Arc<dyn Chunker>,
    embedder: Arc<dyn Embedder>,
    chunks: Arc<dyn ChunkRepository>,
    vectors: Arc<dyn VectorRepository>,
    files: Arc<dyn FileRepository>,
    meta: Arc<dyn MetaRepository>,
    config: PipelineConfig,
}

/// What a run will touch.
struct Plan {
    to_index: Vec<String>,
    to_remove: Vec<String>,
    full: bool,
    incremental: bool,
    /// Paths a full sweep must leave alone.
    preserve: HashSet<String>,
}

/// Result of processing one file that did not abort the run.
enum FileOutcome {
    Indexed {
        created: u64,
        updated: u64,
        deleted: u64,
        vectors: u64,
    },
    /// Skipped; whatever was stored for the path is untouched.
    Failed,
    /// Not started because another file aborted the run.
    Cancelled,
}

/// Everything constant across the files of one run.
struct RunContext<'a> {
    project_id: String,
    tree: &'a TreeId,
    rev: String,
    fingerprint: String,
    worktree_root: Option<&'a std::path::Path>,
    aborted: AtomicBool,
}

/// Indexable-extension and path-glob filter.
struct ScopeFilter {
    extensions: HashSet<String>,
    globs: Option<GlobSet>,
}

impl ScopeFilter {
    fn new(extensions: &[String], patterns: &[String]) -> Result<Self> {
        let globs = if patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in patterns {
                let glob = Glob::new(pattern).map_err(|e| {
                    IndexError::Internal(format!("invalid path filter '{pattern}': {e}"))
                })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|e| {
                IndexError::Internal(format!("invalid path filters: {e}"))
            })?)
        };
        Ok(Self {
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            globs,
        })
    }

    fn indexable(&self, path: &str) -> bool {
        extension(path).is_some_and(|ext| self.extensions.contains(&ext))
    }

    fn selected(&self, path: &str) -> bool {
        self.globs.as_ref().map_or(true, |g| g.is_match(path))
    }

    fn matches(&self, path: &str) -> bool {
        self.indexable(path) && self.selected(path)
    }
}

impl IndexPipeline {
    /// Build a pipeline over a backend that implements every storage port.
    pub fn new<S>(
        vcs: Arc<dyn Vcs>,
        chunker: Arc<dyn Chunker>,
        embedder: Arc<dyn Embedder>,
        store: Arc<S>,
    ) -> Self
    where
        S: ChunkRepository + VectorRepository + FileRepository + MetaRepository + 'static,
    {
        Self {
            vcs,
            chunker,
            embedder,
            chunks: store.clone(),
            vectors: store.clone(),
            files: store.clone(),
            meta: store,
            config: PipelineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Run an index request. Never fails: errors are reported through
    /// `success = false` and `error`, with all counters zeroed.
    pub async fn run(&self, request: &IndexRequest) -> IndexResponse {
        let started = Instant::now();
        match self.try_run(request, started).await {
            Ok(response) => response,
            Err(err) => {
                error!(category = err.category(), "index run failed: {err}");
                IndexResponse::failed(err.to_string(), elapsed_ms(started))
            }
        }
    }

    async fn try_run(&self, request: &IndexRequest, started: Instant) -> Result<IndexResponse> {
        let fingerprint = self.embedder.fingerprint();
        let state = RepoState::load(self.meta.as_ref())
            .await
            .map_err(|e| IndexError::storage(&e))?;

        let model_changed = match &state.model_fingerprint {
            Some(stored) if *stored != fingerprint => {
                if !request.force_reindex {
                    return Err(IndexError::ModelMismatch {
                        stored: stored.clone(),
                        current: fingerprint,
                    });
                }
                true
            }
            _ => false,
        };

        let tree = self
            .vcs
            .resolve_tree(&request.mode)
            .map_err(|e| IndexError::vcs(&e))?;
        let rev = self
            .vcs
            .rev_label(&request.mode)
            .map_err(|e| IndexError::vcs(&e))?;
        let paths: &[String] = if model_changed && !request.paths.is_empty() {
            warn!(
                current = %fingerprint,
                "embedding model changed, ignoring path filters and rebuilding the whole index"
            );
            &[]
        } else {
            &request.paths
        };
        let filter = ScopeFilter::new(&self.config.extensions, paths)?;

        let plan = self.plan(request, &state, &tree, &filter)?;
        info!(
            mode = %request.mode,
            tree = %tree,
            full = plan.full,
            files = plan.to_index.len(),
            removals = plan.to_remove.len(),
            "index run started"
        );

        let mut response = IndexResponse {
            success: true,
            tree_sha: Some(tree.to_string()),
            incremental: plan.incremental,
            ..IndexResponse::default()
        };

        for path in &plan.to_remove {
            response.chunks_deleted += self.remove_path(path).await?;
        }

        let ctx = RunContext {
            project_id: project_id(&request.repo_root),
            tree: &tree,
            rev,
            fingerprint: fingerprint.clone(),
            worktree_root: (request.mode == SyncMode::Worktree)
                .then_some(request.repo_root.as_path()),
            aborted: AtomicBool::new(false),
        };

        let mut preserve = plan.preserve;
        let mut first_error: Option<IndexError> = None;
        let mut outcomes = stream::iter(plan.to_index.iter())
            .map(|path| {
                let ctx = &ctx;
                async move { (path, self.index_file(path, ctx).await) }
            })
            .buffer_unordered(self.config.max_concurrent_files.max(1));

        // Drain every in-flight file even after an abort so none is left
        // half-replaced.
        while let Some((path, outcome)) = outcomes.next().await {
            match outcome {
                Ok(FileOutcome::Indexed {
                    created,
                    updated,
                    deleted,
                    vectors,
                }) => {
                    response.files_indexed += 1;
                    response.chunks_created += created;
                    response.chunks_updated += updated;
                    response.chunks_deleted += deleted;
                    response.vectors_stored += vectors;
                }
                Ok(FileOutcome::Failed) => {
                    response.files_failed += 1;
                    preserve.insert(path.clone());
                }
                Ok(FileOutcome::Cancelled) => {}
                Err(err) => {
                    ctx.aborted.store(true, Ordering::SeqCst);
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
        }
        drop(outcomes);

        if let Some(err) = first_error {
            return Err(err);
        }

        if plan.full {
            response.chunks_deleted += self.sweep(&tree, &preserve).await?;
        }
        if model_changed {
            response.chunks_deleted += self.purge_other_models(&fingerprint).await?;
        }

        RepoState::reached(&tree, &request.mode, &fingerprint)
            .save(self.meta.as_ref())
            .await
            .map_err(|e| IndexError::storage(&e))?;

        response.duration_ms = elapsed_ms(started);
        info!(
            files_indexed = response.files_indexed,
            files_failed = response.files_failed,
            chunks_created = response.chunks_created,
            chunks_updated = response.chunks_updated,
            chunks_deleted = response.chunks_deleted,
            vectors_stored = response.vectors_stored,
            incremental = response.incremental,
            duration_ms = response.duration_ms,
            "index run finished"
        );
        Ok(response)
    }

    fn plan(
        &self,
        request: &IndexRequest,
        state: &RepoState,
        tree: &TreeId,
        filter: &ScopeFilter,
    ) -> Result<Plan> {
        let full = request.force_reindex || state.last_tree_sha.is_none();

        if full {
            let tracked = self
                .vcs
                .list_tracked_files(tree)
                .map_err(|e| IndexError::vcs(&e))?;
            let preserve = tracked
                .iter()
                .filter(|p| filter.indexable(p) && !filter.selected(p))
                .cloned()
                .collect();
            let to_index = tracked.into_iter().filter(|p| filter.matches(p)).collect();
            return Ok(Plan {
                to_index,
                to_remove: Vec::new(),
                full: true,
                incremental: false,
                preserve,
            });
        }

        let last = state.last_tree_sha.as_ref();
        if last == Some(tree) {
            debug!(tree = %tree, "tree unchanged since last run");
            return Ok(Plan {
                to_index: Vec::new(),
                to_remove: Vec::new(),
                full: false,
                incremental: false,
                preserve: HashSet::new(),
            });
        }

        let changes = self
            .vcs
            .diff(last, tree)
            .map_err(|e| IndexError::vcs(&e))?;
        let mut to_index = Vec::new();
        let mut to_remove = Vec::new();
        for change in changes {
            match change.status {
                ChangeStatus::Added | ChangeStatus::Modified => {
                    if filter.matches(&change.path) {
                        to_index.push(change.path);
                    }
                }
                ChangeStatus::Renamed => {
                    if let Some(old) = change.old_path {
                        to_remove.push(old);
                    }
                    if filter.matches(&change.path) {
                        to_index.push(change.path);
                    }
                }
                ChangeStatus::Deleted => to_remove.push(change.path),
            }
        }
        // A path that is removed and re-added in one diff is simply re-indexed.
        to_remove.retain(|p| !to_index.contains(p));

        Ok(Plan {
            to_index,
            to_remove,
            full: false,
            incremental: true,
            preserve: HashSet::new(),
        })
    }

    async fn index_file(&self, path: &str, ctx: &RunContext<'_>) -> Result<FileOutcome> {
        if ctx.aborted.load(Ordering::SeqCst) {
            return Ok(FileOutcome::Cancelled);
        }

        let bytes = self
            .vcs
            .read_at(path, ctx.tree)
            .map_err(|e| IndexError::io(path, &e))?;
        let text = String::from_utf8_lossy(&bytes);
        let lang = detect_language(path);

        let candidates = match self.chunker.chunk(&text, path, lang) {
            Ok(c) => c,
            Err(e) => {
                warn!(path, "chunking failed, keeping stored chunks: {e:#}");
                return Ok(FileOutcome::Failed);
            }
        };

        let file_hash = sha256_hex(&bytes);
        let mut seen = HashSet::new();
        let new_chunks: Vec<Chunk> = candidates
            .into_iter()
            .filter_map(|c| {
                let id = chunk_id(&ctx.project_id, path, c.start_line, c.end_line);
                seen.insert(id.clone()).then(|| Chunk {
                    id,
                    project_id: ctx.project_id.clone(),
                    path: path.to_string(),
                    lang: c.lang,
                    symbol: c.symbol,
                    start_line: c.start_line,
                    end_line: c.end_line,
                    content_hash: content_hash(&c.content),
                    content: c.content,
                    file_hash: file_hash.clone(),
                    tree_sha: ctx.tree.to_string(),
                    rev: ctx.rev.clone(),
                })
            })
            .collect();

        let mut created = 0u64;
        let mut updated = 0u64;
        for chunk in &new_chunks {
            let existing = self
                .chunks
                .find_by_content_hash(&chunk.content_hash)
                .await
                .map_err(|e| IndexError::storage(&e))?;
            if existing.is_empty() {
                created += 1;
            } else {
                updated += 1;
            }
        }

        let texts: Vec<String> = new_chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embed_batched(&texts).await?;
        if vectors.len() != new_chunks.len() {
            warn!(
                path,
                expected = new_chunks.len(),
                got = vectors.len(),
                "embedding count mismatch, keeping stored chunks"
            );
            return Ok(FileOutcome::Failed);
        }

        // Snapshot what is stored now, then replace it.
        let previous = self
            .chunks
            .list_for_path(path)
            .await
            .map_err(|e| IndexError::storage(&e))?;
        let mut snapshot = Vec::with_capacity(previous.len());
        for chunk in previous {
            let stored = self
                .vectors
                .get(&chunk.id)
                .await
                .map_err(|e| IndexError::storage(&e))?;
            snapshot.push((chunk, stored));
        }

        if let Err(e) = self
            .replace_path(path, &new_chunks, &vectors, &ctx.fingerprint)
            .await
        {
            error!(path, "storage failed while replacing chunks, restoring: {e:#}");
            self.restore_path(path, &new_chunks, &snapshot).await;
            return Err(IndexError::storage(&e));
        }

        let new_ids: HashSet<&str> = new_chunks.iter().map(|c| c.id.as_str()).collect();
        let deleted = snapshot
            .iter()
            .filter(|(c, _)| !new_ids.contains(c.id.as_str()))
            .count() as u64;

        let mtime = ctx
            .worktree_root
            .and_then(|root| file_mtime(&root.join(path)))
            .unwrap_or_else(|| chrono::Utc::now().timestamp());
        if let Err(e) = self
            .files
            .track(path, &file_hash, bytes.len() as u64, mtime)
            .await
        {
            warn!(path, "failed to record file state: {e:#}");
        }

        debug!(path, chunks = new_chunks.len(), created, updated, deleted, "indexed file");
        Ok(FileOutcome::Indexed {
            created,
            updated,
            deleted,
            vectors: vectors.len() as u64,
        })
    }

    /// Embed in batches of `embed_batch_size`. A service error aborts the
    /// run; a short batch surfaces as a length mismatch to the caller.
    async fn embed_batched(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.config.embed_batch_size.max(1)) {
            let vectors = self
                .embedder
                .embed(batch)
                .await
                .map_err(|e| IndexError::embedding(&e))?;
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn replace_path(
        &self,
        path: &str,
        chunks: &[Chunk],
        vectors: &[Vec<f32>],
        fingerprint: &str,
    ) -> anyhow::Result<()> {
        let new_ids: HashSet<&str> = chunks.iter().map(|c| c.id.as_str()).collect();
        for id in self.chunks.delete_all_for_path(path).await? {
            if !new_ids.contains(id.as_str()) {
                self.vectors.delete(&id).await?;
            }
        }
        for (chunk, vector) in chunks.iter().zip(vectors) {
            self.chunks.upsert(chunk).await?;
            self.vectors.upsert(&chunk.id, vector, fingerprint).await?;
        }
        Ok(())
    }

    /// Best-effort rollback of `path` to `snapshot`.
    async fn restore_path(
        &self,
        path: &str,
        attempted: &[Chunk],
        snapshot: &[(Chunk, Option<StoredVector>)],
    ) {
        let result: anyhow::Result<()> = async {
            self.chunks.delete_all_for_path(path).await?;
            for chunk in attempted {
                self.vectors.delete(&chunk.id).await?;
            }
            for (chunk, stored) in snapshot {
                self.chunks.upsert(chunk).await?;
                if let Some(stored) = stored {
                    self.vectors
                        .upsert(&chunk.id, &stored.vector, &stored.fingerprint)
                        .await?;
                }
            }
            Ok(())
        }
        .await;
        if let Err(e) = result {
            error!(path, "rollback failed: {e:#}");
        }
    }

    async fn remove_path(&self, path: &str) -> Result<u64> {
        let removed = self
            .chunks
            .delete_all_for_path(path)
            .await
            .map_err(|e| IndexError::storage(&e))?;
        for id in &removed {
            self.vectors
                .delete(id)
                .await
                .map_err(|e| IndexError::storage(&e))?;
        }
        if let Err(e) = self.files.forget(path).await {
            warn!(path, "failed to forget file state: {e:#}");
        }
        debug!(path, chunks = removed.len(), "removed path");
        Ok(removed.len() as u64)
    }

    async fn sweep(&self, tree: &TreeId, preserve: &HashSet<String>) -> Result<u64> {
        let removed = self
            .chunks
            .delete_where_tree_sha_not(tree.as_str(), preserve)
            .await
            .map_err(|e| IndexError::storage(&e))?;
        for id in &removed {
            self.vectors
                .delete(id)
                .await
                .map_err(|e| IndexError::storage(&e))?;
        }
        if !removed.is_empty() {
            info!(chunks = removed.len(), "swept chunks from older trees");
        }
        Ok(removed.len() as u64)
    }

    /// Remove every vector written under a model other than `fingerprint`,
    /// and its chunk. Returns the number of chunks removed.
    async fn purge_other_models(&self, fingerprint: &str) -> Result<u64> {
        let stale = self
            .vectors
            .ids_with_other_fingerprint(fingerprint)
            .await
            .map_err(|e| IndexError::storage(&e))?;
        for id in &stale {
            self.chunks
                .delete(id)
                .await
                .map_err(|e| IndexError::storage(&e))?;
            self.vectors
                .delete(id)
                .await
                .map_err(|e| IndexError::storage(&e))?;
        }
        if !stale.is_empty() {
            warn!(chunks = stale.len(), "removed chunks embedded by a previous model");
        }
        Ok(stale.len() as u64)
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn file_mtime(path: &std::path::Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let secs = modified.duration_since(UNIX_EPOCH).ok()?.as_secs();
    i64::try_from(secs).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_filter_combines_extensions_and_globs() {
        let filter = ScopeFilter::new(
            &["rs".to_string(), "py".to_string()],
            &["src/**".to_string(), "tools/*.py".to_string()],
        )
        .unwrap();
        assert!(filter.matches("src/lib.rs"));
        assert!(filter.matches("tools/gen.py"));
        assert!(!filter.matches("src/README.md"));
        assert!(!filter.matches("tests/it.rs"));
        assert!(filter.indexable("tests/it.rs"));
        assert!(!filter.selected("tests/it.rs"));
    }

    #[test]
    fn scope_filter_without_globs_selects_everything() {
        let filter = ScopeFilter::new(&["RS".to_string()], &[]).unwrap();
        assert!(filter.matches("a/b/c.rs"));
        assert!(!filter.matches("Makefile"));
    }

    #[test]
    fn invalid_glob_is_rejected() {
        let err = ScopeFilter::new(&[], &["src/[".to_string()]).err().unwrap();
        assert_eq!(err.category(), "internal");
    }
}
