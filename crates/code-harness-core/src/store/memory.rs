//! In-memory implementation of every storage and retrieval port.
//!
//! Uses `HashMap`s behind `std::sync::RwLock` for thread safety. Lexical
//! search is a straightforward BM25 over whitespace/punctuation tokens;
//! vector search is brute-force cosine similarity over all stored vectors.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::models::Chunk;

use super::{
    path_matcher, query_terms, ChunkRepository, FileRepository, MetaRepository, ScoredId,
    StoredVector, TextSearch, VectorRepository, VectorSearch,
};

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

/// Bookkeeping record kept per tracked path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFile {
    pub hash: String,
    pub size: u64,
    pub mtime: i64,
}

/// In-memory index for tests and ephemeral use.
#[derive(Default)]
pub struct InMemoryIndex {
    chunks: RwLock<HashMap<String, Chunk>>,
    vectors: RwLock<HashMap<String, StoredVector>>,
    files: RwLock<HashMap<String, TrackedFile>>,
    meta: RwLock<BTreeMap<String, String>>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("in-memory index lock poisoned")
}

/// Lowercased search terms of a text.
fn terms(text: &str) -> Vec<String> {
    query_terms(text)
        .into_iter()
        .map(str::to_lowercase)
        .collect()
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every stored chunk, sorted by (path, start line).
    pub fn all_chunks(&self) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut out: Vec<Chunk> = chunks.values().cloned().collect();
        out.sort_by(|a, b| (&a.path, a.start_line).cmp(&(&b.path, b.start_line)));
        Ok(out)
    }

    /// Number of stored vectors.
    pub fn vector_count(&self) -> Result<usize> {
        Ok(self.vectors.read().map_err(poisoned)?.len())
    }

    /// Fingerprint a stored vector was written with.
    pub fn vector_fingerprint(&self, chunk_id: &str) -> Result<Option<String>> {
        let vectors = self.vectors.read().map_err(poisoned)?;
        Ok(vectors.get(chunk_id).map(|v| v.fingerprint.clone()))
    }

    pub fn tracked_file(&self, path: &str) -> Result<Option<TrackedFile>> {
        Ok(self.files.read().map_err(poisoned)?.get(path).cloned())
    }
}

#[async_trait]
impl ChunkRepository for InMemoryIndex {
    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        chunks.insert(chunk.id.clone(), chunk.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        Ok(self.chunks.read().map_err(poisoned)?.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.chunks.write().map_err(poisoned)?.remove(id);
        Ok(())
    }

    async fn list_for_path(&self, path: &str) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        let mut out: Vec<Chunk> = chunks.values().filter(|c| c.path == path).cloned().collect();
        out.sort_by_key(|c| c.start_line);
        Ok(out)
    }

    async fn delete_all_for_path(&self, path: &str) -> Result<Vec<String>> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let ids: Vec<String> = chunks
            .values()
            .filter(|c| c.path == path)
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            chunks.remove(id);
        }
        Ok(ids)
    }

    async fn delete_where_tree_sha_not(
        &self,
        tree_sha: &str,
        preserve: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let mut chunks = self.chunks.write().map_err(poisoned)?;
        let ids: Vec<String> = chunks
            .values()
            .filter(|c| c.tree_sha != tree_sha && !preserve.contains(&c.path))
            .map(|c| c.id.clone())
            .collect();
        for id in &ids {
            chunks.remove(id);
        }
        Ok(ids)
    }

    async fn find_by_content_hash(&self, hash: &str) -> Result<Vec<Chunk>> {
        let chunks = self.chunks.read().map_err(poisoned)?;
        Ok(chunks
            .values()
            .filter(|c| c.content_hash == hash)
            .cloned()
            .collect())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.chunks.read().map_err(poisoned)?.len() as u64)
    }
}

#[async_trait]
impl VectorRepository for InMemoryIndex {
    async fn upsert(&self, chunk_id: &str, vector: &[f32], fingerprint: &str) -> Result<()> {
        let mut vectors = self.vectors.write().map_err(poisoned)?;
        vectors.insert(
            chunk_id.to_string(),
            StoredVector {
                vector: vector.to_vec(),
                fingerprint: fingerprint.to_string(),
            },
        );
        Ok(())
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<StoredVector>> {
        let vectors = self.vectors.read().map_err(poisoned)?;
        Ok(vectors.get(chunk_id).cloned())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        self.vectors.write().map_err(poisoned)?.remove(chunk_id);
        Ok(())
    }

    async fn ids_with_other_fingerprint(&self, fingerprint: &str) -> Result<Vec<String>> {
        let vectors = self.vectors.read().map_err(poisoned)?;
        let mut ids: Vec<String> = vectors
            .iter()
            .filter(|(_, v)| v.fingerprint != fingerprint)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl FileRepository for InMemoryIndex {
    async fn track(&self, path: &str, hash: &str, size: u64, mtime: i64) -> Result<()> {
        self.files.write().map_err(poisoned)?.insert(
            path.to_string(),
            TrackedFile {
                hash: hash.to_string(),
                size,
                mtime,
            },
        );
        Ok(())
    }

    async fn forget(&self, path: &str) -> Result<()> {
        self.files.write().map_err(poisoned)?.remove(path);
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.files.read().map_err(poisoned)?.len() as u64)
    }
}

#[async_trait]
impl MetaRepository for InMemoryIndex {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.meta.read().map_err(poisoned)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.meta
            .write()
            .map_err(poisoned)?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn set_many(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let mut meta = self.meta.write().map_err(poisoned)?;
        for (k, v) in pairs {
            meta.insert((*k).to_string(), (*v).to_string());
        }
        Ok(())
    }
}

#[async_trait]
impl TextSearch for InMemoryIndex {
    async fn query(
        &self,
        text: &str,
        topk: usize,
        path_filter: Option<&str>,
    ) -> Result<Vec<ScoredId>> {
        let query_terms: HashSet<String> = terms(text).into_iter().collect();
        if query_terms.is_empty() {
            bail!("lexical query has no searchable terms: {text:?}");
        }
        let matcher = path_matcher(path_filter)?;

        let chunks = self.chunks.read().map_err(poisoned)?;
        let docs: Vec<(&Chunk, Vec<String>)> = chunks
            .values()
            .filter(|c| matcher.as_ref().map_or(true, |m| m.is_match(&c.path)))
            .map(|c| (c, terms(&c.content)))
            .collect();
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let n = docs.len() as f64;
        let avg_len = docs.iter().map(|(_, t)| t.len()).sum::<usize>() as f64 / n;
        let mut df: HashMap<&str, usize> = HashMap::new();
        for (_, doc_terms) in &docs {
            let unique: HashSet<&str> = doc_terms.iter().map(String::as_str).collect();
            for term in unique {
                if query_terms.contains(term) {
                    *df.entry(term).or_default() += 1;
                }
            }
        }

        let mut scored: Vec<ScoredId> = docs
            .iter()
            .filter_map(|(chunk, doc_terms)| {
                let len = doc_terms.len() as f64;
                let score: f64 = query_terms
                    .iter()
                    .filter_map(|term| {
                        let tf = doc_terms.iter().filter(|t| *t == term).count() as f64;
                        if tf == 0.0 {
                            return None;
                        }
                        let df = *df.get(term.as_str())? as f64;
                        let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                        let norm = BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len.max(1.0));
                        Some(idf * tf * (BM25_K1 + 1.0) / (tf + norm))
                    })
                    .sum();
                (score > 0.0).then(|| (chunk.id.clone(), score))
            })
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(topk);
        Ok(scored)
    }
}

#[async_trait]
impl VectorSearch for InMemoryIndex {
    async fn query(
        &self,
        vector: &[f32],
        topk: usize,
        path_filter: Option<&str>,
    ) -> Result<Vec<ScoredId>> {
        let matcher = path_matcher(path_filter)?;
        let vectors = self.vectors.read().map_err(poisoned)?;
        let chunks = self.chunks.read().map_err(poisoned)?;

        let mut scored: Vec<ScoredId> = vectors
            .iter()
            .filter(|(id, _)| match (&matcher, chunks.get(*id)) {
                (None, _) => true,
                (Some(m), Some(c)) => m.is_match(&c.path),
                (Some(_), None) => false,
            })
            .map(|(id, sv)| (id.clone(), f64::from(cosine_similarity(vector, &sv.vector))))
            .collect();

        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(topk);
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: &str, path: &str, tree: &str, content: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            project_id: "p".to_string(),
            path: path.to_string(),
            lang: "rust".to_string(),
            symbol: None,
            start_line: 1,
            end_line: 1,
            content: content.to_string(),
            content_hash: crate::chunk::content_hash(content),
            file_hash: "f".to_string(),
            tree_sha: tree.to_string(),
            rev: "worktree".to_string(),
        }
    }

    #[tokio::test]
    async fn delete_where_tree_sha_not_respects_preserve() {
        let idx = InMemoryIndex::new();
        ChunkRepository::upsert(&idx, &chunk("a", "a.rs", "t1", "x")).await.unwrap();
        ChunkRepository::upsert(&idx, &chunk("b", "b.rs", "t1", "y")).await.unwrap();
        ChunkRepository::upsert(&idx, &chunk("c", "c.rs", "t2", "z")).await.unwrap();

        let preserve: HashSet<String> = ["b.rs".to_string()].into_iter().collect();
        let removed = idx.delete_where_tree_sha_not("t2", &preserve).await.unwrap();
        assert_eq!(removed, vec!["a".to_string()]);
        assert_eq!(ChunkRepository::count(&idx).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn text_search_ranks_by_bm25_and_filters_paths() {
        let idx = InMemoryIndex::new();
        ChunkRepository::upsert(&idx, &chunk("a", "src/a.rs", "t", "fn parse_config() { parse }"))
            .await
            .unwrap();
        ChunkRepository::upsert(&idx, &chunk("b", "src/b.rs", "t", "fn render() {}"))
            .await
            .unwrap();
        ChunkRepository::upsert(&idx, &chunk("c", "docs/c.md", "t", "parse_config docs"))
            .await
            .unwrap();

        let hits = TextSearch::query(&idx, "parse_config", 10, None).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"a") && ids.contains(&"c"));
        assert!(hits.iter().all(|(_, s)| *s > 0.0));

        let hits = TextSearch::query(&idx, "parse_config", 10, Some("src/**"))
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, "a");
    }

    #[tokio::test]
    async fn text_search_rejects_empty_query() {
        let idx = InMemoryIndex::new();
        assert!(TextSearch::query(&idx, "   ", 10, None).await.is_err());
    }

    #[tokio::test]
    async fn vector_search_orders_by_similarity() {
        let idx = InMemoryIndex::new();
        ChunkRepository::upsert(&idx, &chunk("a", "a.rs", "t", "a")).await.unwrap();
        ChunkRepository::upsert(&idx, &chunk("b", "b.rs", "t", "b")).await.unwrap();
        VectorRepository::upsert(&idx, "a", &[1.0, 0.0], "fp").await.unwrap();
        VectorRepository::upsert(&idx, "b", &[0.6, 0.8], "fp").await.unwrap();

        let hits = VectorSearch::query(&idx, &[0.0, 1.0], 10, None).await.unwrap();
        assert_eq!(hits[0].0, "b");
        assert_eq!(hits[1].0, "a");

        let hits = VectorSearch::query(&idx, &[0.0, 1.0], 10, Some("a.rs")).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(idx.vector_fingerprint("a").unwrap().as_deref(), Some("fp"));
    }

    #[tokio::test]
    async fn vectors_keep_their_fingerprint() {
        let idx = InMemoryIndex::new();
        VectorRepository::upsert(&idx, "b", &[1.0], "old").await.unwrap();
        VectorRepository::upsert(&idx, "a", &[1.0], "old").await.unwrap();
        VectorRepository::upsert(&idx, "c", &[1.0], "new").await.unwrap();

        let stored = VectorRepository::get(&idx, "a").await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, "old");
        assert_eq!(idx.ids_with_other_fingerprint("new").await.unwrap(), vec!["a", "b"]);
        assert_eq!(idx.ids_with_other_fingerprint("old").await.unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn set_many_writes_all_pairs() {
        let idx = InMemoryIndex::new();
        idx.set_many(&[("k1", "v1"), ("k2", "v2")]).await.unwrap();
        assert_eq!(MetaRepository::get(&idx, "k1").await.unwrap().as_deref(), Some("v1"));
        assert_eq!(MetaRepository::get(&idx, "k2").await.unwrap().as_deref(), Some("v2"));
    }
}
