//! The `chx search` command.

use anyhow::{Context, Result};
use std::sync::Arc;

use code_harness_core::models::Query;
use code_harness_core::search::{SearchEngine, SearchOutcome};

use crate::config::Config;
use crate::embedding::create_embedder;
use crate::sqlite_store::SqliteIndex;

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub limit: Option<usize>,
    pub path: Option<String>,
    pub lang: Option<String>,
    pub explain: bool,
    pub json: bool,
}

/// Run one hybrid query against the configured index.
pub async fn search(config: &Config, text: &str, opts: &SearchOptions) -> Result<SearchOutcome> {
    let store = Arc::new(SqliteIndex::open(config).await?);
    let embedder = create_embedder(&config.embedding)?;
    let engine = SearchEngine::new(embedder, store.clone()).with_params(config.search_params());

    let mut query = Query::new(text, opts.limit.unwrap_or(config.retrieval.final_limit));
    if let Some(path) = &opts.path {
        query = query.with_path_filter(path);
    }
    if let Some(lang) = &opts.lang {
        query = query.with_lang(lang);
    }

    let outcome = engine
        .search(&query)
        .await
        .with_context(|| format!("search for {:?} failed", text))?;

    store.pool().close().await;
    Ok(outcome)
}

pub async fn run_search(config: &Config, text: &str, opts: &SearchOptions) -> Result<()> {
    let outcome = search(config, text, opts).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&outcome)?);
        return Ok(());
    }

    if outcome.results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for result in &outcome.results {
        let chunk = &result.chunk;
        println!(
            "{}. [{:.4}] {}:{}-{}{}",
            result.rank,
            result.score,
            chunk.path,
            chunk.start_line,
            chunk.end_line,
            chunk
                .symbol
                .as_deref()
                .map(|s| format!(" ({})", s))
                .unwrap_or_default()
        );
        if opts.explain {
            println!(
                "    bm25: {:.4}  vector: {:.4}  fused: {:.6}",
                result.explanation.bm25_score,
                result.explanation.vector_score,
                result.explanation.fused_score
            );
        }
        for line in result.preview.lines() {
            println!("    | {}", line);
        }
        println!();
    }

    if opts.explain {
        println!(
            "candidates: {} lexical, {} vector, {} missing",
            outcome.lexical_candidates, outcome.vector_candidates, outcome.missing_chunks
        );
    }

    Ok(())
}
