//! Hybrid retrieval with reciprocal rank fusion.
//!
//! The engine operates entirely through the retrieval and storage ports.
//!
//! # Algorithm
//!
//! 1. Reject a query with no search terms, then embed it once.
//! 2. Compute the candidate pool: `max(limit × pool_multiplier, min_pool)`.
//! 3. Query the lexical and vector indexes concurrently for `pool`
//!    candidates each, with the path filter pushed down.
//! 4. Fuse by rank: `score(id) = Σ 1 / (k + rank)` over the lists that
//!    contain `id` (ranks are 1-indexed). Ties break by id ascending.
//! 5. Resolve the top `limit` fused ids to chunks, counting ids the chunk
//!    store no longer has.
//! 6. Drop chunks of other languages; the list may come out shorter.
//! 7. Attach rank, preview, and the per-list scores.
//!
//! Raw BM25 and cosine scores live on unrelated scales; fusing by rank
//! avoids normalizing them against each other.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::embedding::{embed_one, Embedder};
use crate::error::{IndexError, Result};
use crate::models::{Query, ScoreExplanation, SearchResult};
use crate::store::{query_terms, ChunkRepository, ScoredId, TextSearch, VectorSearch};

/// Appended to a preview that does not show the whole chunk.
pub const PREVIEW_MARKER: &str = "…";

/// Retrieval tuning parameters, decoupled from application config.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// RRF damping constant.
    pub rrf_k: f64,
    /// Candidates fetched per list, as a multiple of the result limit.
    pub pool_multiplier: usize,
    /// Lower bound on candidates fetched per list.
    pub min_pool: usize,
    /// Lines of chunk content shown in a preview.
    pub preview_lines: usize,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            pool_multiplier: 5,
            min_pool: 100,
            preview_lines: 6,
        }
    }
}

impl SearchParams {
    pub fn pool_size(&self, limit: usize) -> usize {
        limit.saturating_mul(self.pool_multiplier).max(self.min_pool)
    }
}

/// Results of one query plus candidate bookkeeping.
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<SearchResult>,
    /// Fused ids whose chunk could not be found (index drift).
    pub missing_chunks: usize,
    pub lexical_candidates: usize,
    pub vector_candidates: usize,
}

/// Hybrid search over injected ports.
pub struct SearchEngine {
    embedder: Arc<dyn Embedder>,
    text: Arc<dyn TextSearch>,
    vector: Arc<dyn VectorSearch>,
    chunks: Arc<dyn ChunkRepository>,
    params: SearchParams,
}

impl SearchEngine {
    /// Build an engine over a backend that implements every retrieval port.
    pub fn new<S>(embedder: Arc<dyn Embedder>, store: Arc<S>) -> Self
    where
        S: TextSearch + VectorSearch + ChunkRepository + 'static,
    {
        Self {
            embedder,
            text: store.clone(),
            vector: store.clone(),
            chunks: store,
            params: SearchParams::default(),
        }
    }

    pub fn with_params(mut self, params: SearchParams) -> Self {
        self.params = params;
        self
    }

    pub async fn search(&self, query: &Query) -> Result<SearchOutcome> {
        if query_terms(&query.text).is_empty() {
            return Err(IndexError::Search(format!(
                "query has no searchable terms: {:?}",
                query.text
            )));
        }

        let query_vec = embed_one(self.embedder.as_ref(), &query.text)
            .await
            .map_err(|e| IndexError::embedding(&e))?;

        let pool = self.params.pool_size(query.limit);
        let filter = query.path_filter.as_deref();
        let (lexical, semantic) = futures::try_join!(
            self.text.query(&query.text, pool, filter),
            self.vector.query(&query_vec, pool, filter),
        )
        .map_err(|e| IndexError::search(&e))?;

        debug!(
            lexical = lexical.len(),
            vector = semantic.len(),
            pool,
            "retrieved candidates"
        );

        let fused = rrf_fuse(&[&lexical[..], &semantic[..]], self.params.rrf_k);
        let bm25: HashMap<&str, f64> = lexical.iter().map(|(id, s)| (id.as_str(), *s)).collect();
        let cosine: HashMap<&str, f64> =
            semantic.iter().map(|(id, s)| (id.as_str(), *s)).collect();

        let mut results = Vec::new();
        let mut missing_chunks = 0usize;
        for (id, fused_score) in fused.iter().take(query.limit) {
            let Some(chunk) = self
                .chunks
                .get(id)
                .await
                .map_err(|e| IndexError::storage(&e))?
            else {
                missing_chunks += 1;
                continue;
            };
            if let Some(lang) = &query.lang {
                if chunk.lang != *lang {
                    continue;
                }
            }
            let snippet = preview(&chunk.content, self.params.preview_lines);
            results.push(SearchResult {
                rank: results.len() + 1,
                score: *fused_score,
                preview: snippet,
                explanation: ScoreExplanation {
                    bm25_score: bm25.get(id.as_str()).copied().unwrap_or(0.0),
                    vector_score: cosine.get(id.as_str()).copied().unwrap_or(0.0),
                    fused_score: *fused_score,
                },
                chunk,
            });
        }

        if missing_chunks > 0 {
            warn!(
                missing_chunks,
                "search candidates reference chunks that no longer exist"
            );
        }

        Ok(SearchOutcome {
            results,
            missing_chunks,
            lexical_candidates: lexical.len(),
            vector_candidates: semantic.len(),
        })
    }
}

/// Reciprocal rank fusion of ranked id lists.
///
/// Each list must be ordered best-first. Returns every id that appears in
/// any list with its fused score, highest first, ties broken by id.
pub fn rrf_fuse(lists: &[&[ScoredId]], k: f64) -> Vec<(String, f64)> {
    let mut scores: HashMap<&str, f64> = HashMap::new();
    for list in lists {
        for (idx, (id, _)) in list.iter().enumerate() {
            let rank = (idx + 1) as f64;
            *scores.entry(id.as_str()).or_default() += 1.0 / (k + rank);
        }
    }

    let mut fused: Vec<(String, f64)> = scores
        .into_iter()
        .map(|(id, score)| (id.to_string(), score))
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(&b.0))
    });
    fused
}

/// First `lines` lines of `content`, with [`PREVIEW_MARKER`] if cut.
pub fn preview(content: &str, lines: usize) -> String {
    let mut iter = content.lines();
    let shown: Vec<&str> = iter.by_ref().take(lines).collect();
    let mut out = shown.join("\n");
    if iter.next().is_some() {
        out.push('\n');
        out.push_str(PREVIEW_MARKER);
    }
    out
}
