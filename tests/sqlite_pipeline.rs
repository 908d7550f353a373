//! The indexing pipeline and search engine running over the SQLite backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;

use code_harness::index_cmd::build_chunker;
use code_harness::config::ChunkingConfig;
use code_harness::migrate::migrate;
use code_harness::sqlite_store::SqliteIndex;
use code_harness_core::embedding::{Embedder, HashingEmbedder};
use code_harness_core::models::{IndexRequest, Query, SyncMode};
use code_harness_core::pipeline::IndexPipeline;
use code_harness_core::search::SearchEngine;
use code_harness_core::store::{ChunkRepository, MetaRepository, VectorRepository};
use code_harness_core::vcs::memory::MemoryVcs;

const ALPHA: &str = "pub fn alpha_handler() {\n    run_alpha();\n}\n\npub fn alpha_helper() {\n    help();\n}\n";
const BETA: &str = "pub fn beta_handler() {\n    run_beta();\n}\n";

/// Hashing embedder that fails every call once tripped.
struct TrippingEmbedder {
    inner: HashingEmbedder,
    tripped: AtomicBool,
}

#[async_trait]
impl Embedder for TrippingEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if self.tripped.load(Ordering::SeqCst) {
            bail!("embedding service unavailable");
        }
        self.inner.embed(texts).await
    }

    fn fingerprint(&self) -> String {
        self.inner.fingerprint()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }
}

async fn store() -> Arc<SqliteIndex> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    migrate(&pool).await.unwrap();
    Arc::new(SqliteIndex::new(pool))
}

fn pipeline(vcs: &Arc<MemoryVcs>, embedder: Arc<dyn Embedder>, store: &Arc<SqliteIndex>) -> IndexPipeline {
    let chunker = build_chunker(&ChunkingConfig::default()).unwrap();
    IndexPipeline::new(vcs.clone(), chunker, embedder, store.clone())
}

async fn snapshot(store: &SqliteIndex, path: &str) -> Vec<(String, String, Vec<f32>)> {
    let mut out = Vec::new();
    for chunk in store.list_for_path(path).await.unwrap() {
        let stored = VectorRepository::get(store, &chunk.id).await.unwrap().unwrap();
        out.push((chunk.id, chunk.content, stored.vector));
    }
    out
}

#[tokio::test]
async fn test_forced_reindex_is_idempotent() {
    let vcs = Arc::new(MemoryVcs::new());
    vcs.write("src/alpha.rs", ALPHA).unwrap();
    vcs.write("src/beta.rs", BETA).unwrap();
    let store = store().await;
    let p = pipeline(&vcs, Arc::new(HashingEmbedder::new(64)), &store);

    let first = p.run(&IndexRequest::new("/repo", SyncMode::Worktree)).await;
    assert!(first.success, "{:?}", first.error);
    let chunks = ChunkRepository::count(store.as_ref()).await.unwrap();
    let before = snapshot(&store, "src/alpha.rs").await;

    for _ in 0..2 {
        let again = p
            .run(&IndexRequest::new("/repo", SyncMode::Worktree).force(true))
            .await;
        assert!(again.success);
        assert_eq!(again.chunks_created, 0);
    }

    assert_eq!(ChunkRepository::count(store.as_ref()).await.unwrap(), chunks);
    assert_eq!(store.vector_count().await.unwrap(), chunks);
    assert_eq!(snapshot(&store, "src/alpha.rs").await, before);
    assert_eq!(
        MetaRepository::get(store.as_ref(), "last_tree_sha")
            .await
            .unwrap(),
        first.tree_sha
    );
}

#[tokio::test]
async fn test_shrinking_file_leaves_no_stale_rows() {
    let vcs = Arc::new(MemoryVcs::new());
    vcs.write("src/alpha.rs", ALPHA).unwrap();
    let store = store().await;
    let p = pipeline(&vcs, Arc::new(HashingEmbedder::new(64)), &store);
    p.run(&IndexRequest::new("/repo", SyncMode::Worktree)).await;
    assert_eq!(store.list_for_path("src/alpha.rs").await.unwrap().len(), 2);

    vcs.write("src/alpha.rs", "pub fn alpha_handler() {}\n").unwrap();
    let resp = p.run(&IndexRequest::new("/repo", SyncMode::Worktree)).await;
    assert!(resp.success);
    assert!(resp.incremental);
    assert_eq!(store.list_for_path("src/alpha.rs").await.unwrap().len(), 1);
    assert_eq!(store.vector_count().await.unwrap(), 1);

    let engine = SearchEngine::new(Arc::new(HashingEmbedder::new(64)), store.clone());
    let outcome = engine.search(&Query::new("alpha_helper", 5)).await.unwrap();
    assert_eq!(outcome.lexical_candidates, 0);
    assert_eq!(outcome.missing_chunks, 0);
}

#[tokio::test]
async fn test_embedding_failure_keeps_previous_rows() {
    let vcs = Arc::new(MemoryVcs::new());
    vcs.write("src/alpha.rs", ALPHA).unwrap();
    vcs.write("src/beta.rs", BETA).unwrap();
    let store = store().await;
    let embedder = Arc::new(TrippingEmbedder {
        inner: HashingEmbedder::new(64),
        tripped: AtomicBool::new(false),
    });
    let p = pipeline(&vcs, embedder.clone(), &store);
    let first = p.run(&IndexRequest::new("/repo", SyncMode::Worktree)).await;
    let alpha = snapshot(&store, "src/alpha.rs").await;
    let beta = snapshot(&store, "src/beta.rs").await;

    vcs.write("src/alpha.rs", "pub fn replaced() {}\n").unwrap();
    embedder.tripped.store(true, Ordering::SeqCst);
    let resp = p.run(&IndexRequest::new("/repo", SyncMode::Worktree)).await;

    assert!(!resp.success);
    assert!(resp.error.unwrap().contains("embedding"));
    assert_eq!(resp.chunks_created, 0);
    assert_eq!(snapshot(&store, "src/alpha.rs").await, alpha);
    assert_eq!(snapshot(&store, "src/beta.rs").await, beta);
    assert_eq!(
        MetaRepository::get(store.as_ref(), "last_tree_sha")
            .await
            .unwrap(),
        first.tree_sha
    );
}

#[tokio::test]
async fn test_hybrid_search_over_sqlite() {
    let vcs = Arc::new(MemoryVcs::new());
    vcs.write("src/alpha.rs", ALPHA).unwrap();
    vcs.write("src/beta.rs", BETA).unwrap();
    let store = store().await;
    let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(64));
    pipeline(&vcs, embedder.clone(), &store)
        .run(&IndexRequest::new("/repo", SyncMode::Worktree))
        .await;

    let engine = SearchEngine::new(embedder, store.clone());
    let outcome = engine.search(&Query::new("beta_handler", 3)).await.unwrap();
    let top = &outcome.results[0];
    assert_eq!(top.chunk.path, "src/beta.rs");
    assert_eq!(top.chunk.symbol.as_deref(), Some("beta_handler"));
    assert!(top.explanation.bm25_score > 0.0);
    assert!(top.explanation.vector_score > 0.0);
    assert!(outcome.results.len() <= 3);

    let outcome = engine
        .search(&Query::new("handler", 10).with_path_filter("src/alpha.rs"))
        .await
        .unwrap();
    assert!(outcome
        .results
        .iter()
        .all(|r| r.chunk.path == "src/alpha.rs"));
}
