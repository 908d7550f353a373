//! Storage and retrieval ports.
//!
//! The pipeline and the search engine only ever talk to these traits, so
//! backends are pluggable (SQLite in the app crate, [`memory::InMemoryIndex`]
//! here). Each trait is narrow on purpose; one backend type usually
//! implements all of them over a shared connection.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//!
//! # Operations
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ChunkRepository`] | Chunk rows keyed by id, queried by path / tree / content hash |
//! | [`VectorRepository`] | One embedding per chunk id, tagged with the model fingerprint |
//! | [`FileRepository`] | Per-path bookkeeping (hash, size, mtime) |
//! | [`MetaRepository`] | String key/value pairs (repo state) |
//! | [`TextSearch`] | Lexical (BM25) search over chunk content |
//! | [`VectorSearch`] | Similarity search over stored vectors |

pub mod memory;

use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::Chunk;

/// A `(chunk_id, score)` pair from one of the search ports.
///
/// Scores from [`TextSearch`] and [`VectorSearch`] are on unrelated scales
/// and are only ever combined by rank.
pub type ScoredId = (String, f64);

/// An embedding together with the fingerprint of the model that wrote it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredVector {
    pub vector: Vec<f32>,
    pub fingerprint: String,
}

#[async_trait]
pub trait ChunkRepository: Send + Sync {
    /// Insert or replace the chunk with the same id.
    async fn upsert(&self, chunk: &Chunk) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<Chunk>>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// All chunks currently stored for `path`, ordered by start line.
    async fn list_for_path(&self, path: &str) -> Result<Vec<Chunk>>;

    /// Delete every chunk of `path`; returns the ids removed.
    async fn delete_all_for_path(&self, path: &str) -> Result<Vec<String>>;

    /// Delete chunks whose `tree_sha` differs from `tree_sha`, except
    /// those whose path is in `preserve`; returns the ids removed.
    async fn delete_where_tree_sha_not(
        &self,
        tree_sha: &str,
        preserve: &HashSet<String>,
    ) -> Result<Vec<String>>;

    /// Chunks with this exact content hash (any path, any tree).
    async fn find_by_content_hash(&self, hash: &str) -> Result<Vec<Chunk>>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait VectorRepository: Send + Sync {
    async fn upsert(&self, chunk_id: &str, vector: &[f32], fingerprint: &str) -> Result<()>;

    async fn get(&self, chunk_id: &str) -> Result<Option<StoredVector>>;

    async fn delete(&self, chunk_id: &str) -> Result<()>;

    /// Chunk ids whose vector was written under a fingerprint other than
    /// `fingerprint`, sorted.
    async fn ids_with_other_fingerprint(&self, fingerprint: &str) -> Result<Vec<String>>;
}

#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn track(&self, path: &str, hash: &str, size: u64, mtime: i64) -> Result<()>;

    async fn forget(&self, path: &str) -> Result<()>;

    async fn count(&self) -> Result<u64>;
}

#[async_trait]
pub trait MetaRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Write all pairs as one logical update.
    async fn set_many(&self, pairs: &[(&str, &str)]) -> Result<()>;
}

#[async_trait]
pub trait TextSearch: Send + Sync {
    /// Best `topk` chunks for `text`, highest score first.
    ///
    /// An empty or term-less query is an error, not an empty result.
    async fn query(&self, text: &str, topk: usize, path_filter: Option<&str>)
        -> Result<Vec<ScoredId>>;
}

#[async_trait]
pub trait VectorSearch: Send + Sync {
    /// Nearest `topk` chunks to `vector`, highest similarity first.
    async fn query(
        &self,
        vector: &[f32],
        topk: usize,
        path_filter: Option<&str>,
    ) -> Result<Vec<ScoredId>>;
}

/// Search terms of a lexical query: runs of alphanumerics and `_`.
///
/// Both backends tokenize queries this way, so a text with no terms is
/// rejected the same everywhere.
pub fn query_terms(text: &str) -> Vec<&str> {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| !t.is_empty())
        .collect()
}

/// Compile an optional path glob into a matcher.
pub fn path_matcher(glob: Option<&str>) -> Result<Option<globset::GlobMatcher>> {
    glob.map(|g| Ok(globset::Glob::new(g)?.compile_matcher()))
        .transpose()
}
