//! SQLite-backed implementation of every storage and retrieval port.
//!
//! One [`SqliteIndex`] wraps a pool and serves chunk rows, vectors, file
//! bookkeeping, repo metadata, FTS5 lexical search, and brute-force
//! cosine vector search. Schema lives in [`crate::migrate`].

use std::collections::HashSet;

use anyhow::{bail, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use code_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use code_harness_core::models::Chunk;
use code_harness_core::store::{
    path_matcher, query_terms, ChunkRepository, FileRepository, MetaRepository, ScoredId,
    StoredVector, TextSearch, VectorRepository, VectorSearch,
};

use crate::config::Config;
use crate::{db, migrate};

/// SQLite implementation of the storage and retrieval ports.
pub struct SqliteIndex {
    pool: SqlitePool,
}

impl SqliteIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database and ensure the schema exists.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn vector_count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }

    /// Distinct fingerprints of stored vectors with their counts.
    pub async fn vector_fingerprints(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT fingerprint, COUNT(*) AS n FROM chunk_vectors GROUP BY fingerprint ORDER BY fingerprint",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("fingerprint"), r.get::<i64, _>("n") as u64))
            .collect())
    }

    /// Chunk counts per language, largest first.
    pub async fn chunks_by_lang(&self) -> Result<Vec<(String, u64)>> {
        let rows = sqlx::query(
            "SELECT lang, COUNT(*) AS n FROM chunks GROUP BY lang ORDER BY n DESC, lang ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(|r| (r.get("lang"), r.get::<i64, _>("n") as u64))
            .collect())
    }
}

const CHUNK_COLUMNS: &str = "id, project_id, path, lang, symbol, start_line, end_line, content, content_hash, file_hash, tree_sha, rev";

fn row_to_chunk(row: &SqliteRow) -> Chunk {
    let start_line: i64 = row.get("start_line");
    let end_line: i64 = row.get("end_line");
    Chunk {
        id: row.get("id"),
        project_id: row.get("project_id"),
        path: row.get("path"),
        lang: row.get("lang"),
        symbol: row.get("symbol"),
        start_line: start_line as u32,
        end_line: end_line as u32,
        content: row.get("content"),
        content_hash: row.get("content_hash"),
        file_hash: row.get("file_hash"),
        tree_sha: row.get("tree_sha"),
        rev: row.get("rev"),
    }
}

/// Build an FTS5 MATCH expression: every identifier-like token quoted and
/// OR-joined, so user punctuation can never be parsed as query syntax.
fn fts_query(text: &str) -> Option<String> {
    let terms: Vec<String> = query_terms(text)
        .into_iter()
        .map(|t| format!("\"{}\"", t))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" OR "))
    }
}

async fn delete_chunk_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    ids: &[String],
) -> Result<()> {
    for id in ids {
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[async_trait]
impl ChunkRepository for SqliteIndex {
    async fn upsert(&self, chunk: &Chunk) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO chunks (id, project_id, path, lang, symbol, start_line, end_line,
                                content, content_hash, file_hash, tree_sha, rev)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                project_id = excluded.project_id,
                path = excluded.path,
                lang = excluded.lang,
                symbol = excluded.symbol,
                start_line = excluded.start_line,
                end_line = excluded.end_line,
                content = excluded.content,
                content_hash = excluded.content_hash,
                file_hash = excluded.file_hash,
                tree_sha = excluded.tree_sha,
                rev = excluded.rev
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.project_id)
        .bind(&chunk.path)
        .bind(&chunk.lang)
        .bind(&chunk.symbol)
        .bind(chunk.start_line as i64)
        .bind(chunk.end_line as i64)
        .bind(&chunk.content)
        .bind(&chunk.content_hash)
        .bind(&chunk.file_hash)
        .bind(&chunk.tree_sha)
        .bind(&chunk.rev)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(&chunk.id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("INSERT INTO chunks_fts (chunk_id, path, content) VALUES (?, ?, ?)")
            .bind(&chunk.id)
            .bind(&chunk.path)
            .bind(&chunk.content)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_chunk))
    }

    async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        delete_chunk_rows(&mut tx, &[id.to_string()]).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn list_for_path(&self, path: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE path = ? ORDER BY start_line ASC, id ASC"
        ))
        .bind(path)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn delete_all_for_path(&self, path: &str) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let ids: Vec<String> = sqlx::query_scalar("SELECT id FROM chunks WHERE path = ?")
            .bind(path)
            .fetch_all(&mut *tx)
            .await?;
        delete_chunk_rows(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn delete_where_tree_sha_not(
        &self,
        tree_sha: &str,
        preserve: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT id, path FROM chunks WHERE tree_sha != ?")
            .bind(tree_sha)
            .fetch_all(&mut *tx)
            .await?;
        let ids: Vec<String> = rows
            .iter()
            .filter(|r| !preserve.contains(r.get::<&str, _>("path")))
            .map(|r| r.get("id"))
            .collect();
        delete_chunk_rows(&mut tx, &ids).await?;
        tx.commit().await?;
        Ok(ids)
    }

    async fn find_by_content_hash(&self, hash: &str) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE content_hash = ? ORDER BY id ASC"
        ))
        .bind(hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_chunk).collect())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

#[async_trait]
impl VectorRepository for SqliteIndex {
    async fn upsert(&self, chunk_id: &str, vector: &[f32], fingerprint: &str) -> Result<()> {
        let blob = vec_to_blob(vector);
        sqlx::query(
            r#"
            INSERT INTO chunk_vectors (chunk_id, dims, embedding, fingerprint)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(chunk_id) DO UPDATE SET
                dims = excluded.dims,
                embedding = excluded.embedding,
                fingerprint = excluded.fingerprint
            "#,
        )
        .bind(chunk_id)
        .bind(vector.len() as i64)
        .bind(&blob)
        .bind(fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, chunk_id: &str) -> Result<Option<StoredVector>> {
        let row = sqlx::query("SELECT embedding, fingerprint FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| StoredVector {
            vector: blob_to_vec(&r.get::<Vec<u8>, _>("embedding")),
            fingerprint: r.get("fingerprint"),
        }))
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM chunk_vectors WHERE chunk_id = ?")
            .bind(chunk_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn ids_with_other_fingerprint(&self, fingerprint: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT chunk_id FROM chunk_vectors WHERE fingerprint != ? ORDER BY chunk_id",
        )
        .bind(fingerprint)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

#[async_trait]
impl FileRepository for SqliteIndex {
    async fn track(&self, path: &str, hash: &str, size: u64, mtime: i64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO files (path, hash, size, mtime) VALUES (?, ?, ?, ?)
            ON CONFLICT(path) DO UPDATE SET
                hash = excluded.hash,
                size = excluded.size,
                mtime = excluded.mtime
            "#,
        )
        .bind(path)
        .bind(hash)
        .bind(size as i64)
        .bind(mtime)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn forget(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(n as u64)
    }
}

#[async_trait]
impl MetaRepository for SqliteIndex {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM meta WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.set_many(&[(key, value)]).await
    }

    async fn set_many(&self, pairs: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for (key, value) in pairs {
            sqlx::query(
                "INSERT INTO meta (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl TextSearch for SqliteIndex {
    async fn query(
        &self,
        text: &str,
        topk: usize,
        path_filter: Option<&str>,
    ) -> Result<Vec<ScoredId>> {
        let Some(expr) = fts_query(text) else {
            bail!("search query has no searchable terms: {:?}", text);
        };
        let matcher = path_matcher(path_filter)?;

        // FTS5 `rank` is bm25(), lower is better; negate for highest-first.
        // With a path filter the limit is applied after filtering.
        let limit: i64 = if matcher.is_some() { -1 } else { topk as i64 };
        let rows = sqlx::query(
            r#"
            SELECT chunk_id, path, rank
            FROM chunks_fts
            WHERE chunks_fts MATCH ?
            ORDER BY rank, chunk_id
            LIMIT ?
            "#,
        )
        .bind(&expr)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .filter(|row| {
                matcher
                    .as_ref()
                    .map_or(true, |m| m.is_match(row.get::<&str, _>("path")))
            })
            .take(topk)
            .map(|row| {
                let rank: f64 = row.get("rank");
                (row.get("chunk_id"), -rank)
            })
            .collect())
    }
}

#[async_trait]
impl VectorSearch for SqliteIndex {
    async fn query(
        &self,
        vector: &[f32],
        topk: usize,
        path_filter: Option<&str>,
    ) -> Result<Vec<ScoredId>> {
        let matcher = path_matcher(path_filter)?;

        // LEFT JOIN keeps vectors whose chunk row is gone; the engine
        // reports those as missing.
        let rows = sqlx::query(
            r#"
            SELECT cv.chunk_id, cv.embedding, c.path
            FROM chunk_vectors cv
            LEFT JOIN chunks c ON c.id = cv.chunk_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut scored: Vec<ScoredId> = rows
            .iter()
            .filter(|row| {
                let path: Option<&str> = row.get("path");
                match (&matcher, path) {
                    (None, _) => true,
                    (Some(m), Some(p)) => m.is_match(p),
                    (Some(_), None) => false,
                }
            })
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                let similarity = cosine_similarity(vector, &blob_to_vec(&blob)) as f64;
                (row.get("chunk_id"), similarity)
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
