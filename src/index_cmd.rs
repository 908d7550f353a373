//! The `chx index` command.
//!
//! Wires the git adapter, the SQLite index, the configured chunker and
//! embedder into an [`IndexPipeline`] and reports the run.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::sync::Arc;

use code_harness_core::chunk::{Chunker, FallbackChunker, LineWindowChunker, SymbolChunker};
use code_harness_core::models::{IndexRequest, IndexResponse, SyncMode};
use code_harness_core::pipeline::IndexPipeline;

use crate::config::{ChunkingConfig, Config};
use crate::embedding::create_embedder;
use crate::git::GitVcs;
use crate::sqlite_store::SqliteIndex;

/// Options for one `chx index` invocation.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub mode: SyncMode,
    /// Path globs limiting the run; empty means the whole repository.
    pub paths: Vec<String>,
    pub force: bool,
    pub json: bool,
    /// Overrides `index.root`.
    pub root: Option<PathBuf>,
}

/// Build the configured chunker.
pub fn build_chunker(config: &ChunkingConfig) -> Result<Arc<dyn Chunker>> {
    let windows = LineWindowChunker::new(config.window_lines, config.overlap_lines);
    if !config.symbol_chunks {
        return Ok(Arc::new(windows));
    }
    Ok(Arc::new(FallbackChunker::new(
        Box::new(SymbolChunker::new(config.max_symbol_lines)?),
        Box::new(windows),
    )))
}

/// Run the pipeline once and return its response.
pub async fn index(config: &Config, opts: &IndexOptions) -> Result<IndexResponse> {
    let root = opts.root.as_ref().unwrap_or(&config.index.root);
    let vcs = GitVcs::open(root)?;
    let repo_root = vcs.root().to_path_buf();

    let store = Arc::new(SqliteIndex::open(config).await?);
    let embedder = create_embedder(&config.embedding)?;
    let chunker = build_chunker(&config.chunking)?;

    let pipeline = IndexPipeline::new(Arc::new(vcs), chunker, embedder, store.clone())
        .with_config(config.pipeline_config());

    let request = IndexRequest::new(repo_root, opts.mode.clone())
        .with_paths(opts.paths.clone())
        .force(opts.force);
    let response = pipeline.run(&request).await;

    store.pool().close().await;
    Ok(response)
}

pub async fn run_index(config: &Config, opts: &IndexOptions) -> Result<()> {
    let response = index(config, opts).await?;

    if opts.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
    } else {
        print_summary(&opts.mode, &response);
    }

    if !response.success {
        bail!(
            "index failed: {}",
            response.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_summary(mode: &SyncMode, response: &IndexResponse) {
    if !response.success {
        return;
    }

    println!(
        "Indexed {} ({}, {})",
        mode,
        response.tree_sha.as_deref().unwrap_or("-"),
        if response.incremental {
            "incremental"
        } else {
            "full"
        }
    );
    println!("  files indexed:  {}", response.files_indexed);
    println!("  files failed:   {}", response.files_failed);
    println!("  chunks created: {}", response.chunks_created);
    println!("  chunks updated: {}", response.chunks_updated);
    println!("  chunks deleted: {}", response.chunks_deleted);
    println!("  vectors stored: {}", response.vectors_stored);
    println!("  duration:       {} ms", response.duration_ms);
}
