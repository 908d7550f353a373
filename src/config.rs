//! Configuration loading and validation.
//!
//! Configuration lives in a TOML file (default `./config/chx.toml`).
//! Every section except `[db]` is optional and falls back to defaults.
//!
//! # Example
//!
//! ```toml
//! [db]
//! path = "./data/chx.sqlite"
//!
//! [index]
//! root = "."
//! max_concurrent_files = 4
//!
//! [chunking]
//! window_lines = 60
//! overlap_lines = 10
//!
//! [retrieval]
//! final_limit = 10
//!
//! [embedding]
//! provider = "openai"
//! model = "text-embedding-3-small"
//! dims = 1536
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use code_harness_core::lang::default_extensions;
use code_harness_core::pipeline::PipelineConfig;
use code_harness_core::search::SearchParams;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Repository to index. Relative paths resolve against the working
    /// directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            extensions: default_extensions(),
            max_concurrent_files: default_max_concurrent_files(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_max_concurrent_files() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    /// Chunk by top-level definitions first, falling back to line windows.
    #[serde(default = "default_true")]
    pub symbol_chunks: bool,
    /// Definitions longer than this are split into windows.
    #[serde(default = "default_max_symbol_lines")]
    pub max_symbol_lines: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            window_lines: default_window_lines(),
            overlap_lines: default_overlap_lines(),
            symbol_chunks: true,
            max_symbol_lines: default_max_symbol_lines(),
        }
    }
}

fn default_window_lines() -> usize {
    60
}
fn default_overlap_lines() -> usize {
    10
}
fn default_true() -> bool {
    true
}
fn default_max_symbol_lines() -> usize {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    #[serde(default = "default_pool_multiplier")]
    pub pool_multiplier: usize,
    #[serde(default = "default_min_pool")]
    pub min_pool: usize,
    #[serde(default = "default_final_limit")]
    pub final_limit: usize,
    #[serde(default = "default_preview_lines")]
    pub preview_lines: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            pool_multiplier: default_pool_multiplier(),
            min_pool: default_min_pool(),
            final_limit: default_final_limit(),
            preview_lines: default_preview_lines(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}
fn default_pool_multiplier() -> usize {
    5
}
fn default_min_pool() -> usize {
    100
}
fn default_final_limit() -> usize {
    10
}
fn default_preview_lines() -> usize {
    6
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl Config {
    /// Pipeline tunables derived from `[index]` and `[embedding]`.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            extensions: self
                .index
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            max_concurrent_files: self.index.max_concurrent_files,
            embed_batch_size: self.embedding.batch_size,
        }
    }

    pub fn search_params(&self) -> SearchParams {
        SearchParams {
            rrf_k: self.retrieval.rrf_k,
            pool_multiplier: self.retrieval.pool_multiplier,
            min_pool: self.retrieval.min_pool,
            preview_lines: self.retrieval.preview_lines,
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate index
    if config.index.max_concurrent_files == 0 {
        bail!("index.max_concurrent_files must be >= 1");
    }
    if config.index.extensions.is_empty() {
        bail!("index.extensions must not be empty");
    }

    // Validate chunking
    if config.chunking.window_lines == 0 {
        bail!("chunking.window_lines must be > 0");
    }
    if config.chunking.overlap_lines >= config.chunking.window_lines {
        bail!("chunking.overlap_lines must be < chunking.window_lines");
    }
    if config.chunking.max_symbol_lines == 0 {
        bail!("chunking.max_symbol_lines must be > 0");
    }

    // Validate retrieval
    if config.retrieval.final_limit < 1 {
        bail!("retrieval.final_limit must be >= 1");
    }
    if config.retrieval.rrf_k <= 0.0 || !config.retrieval.rrf_k.is_finite() {
        bail!("retrieval.rrf_k must be a positive number");
    }
    if config.retrieval.pool_multiplier < 1 {
        bail!("retrieval.pool_multiplier must be >= 1");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        bail!("embedding.batch_size must be > 0");
    }
    if config.embedding.dims == Some(0) {
        bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hashing" | "local" => {}
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() {
                bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
            other
        ),
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config("[db]\npath = \"./data/chx.sqlite\"\n").unwrap();
        assert_eq!(config.index.root, PathBuf::from("."));
        assert_eq!(config.index.max_concurrent_files, 1);
        assert_eq!(config.chunking.window_lines, 60);
        assert_eq!(config.chunking.overlap_lines, 10);
        assert!(config.chunking.symbol_chunks);
        assert_eq!(config.retrieval.final_limit, 10);
        assert_eq!(config.embedding.provider, "hashing");

        let params = config.search_params();
        assert_eq!(params.rrf_k, 60.0);
        assert_eq!(params.pool_size(10), 100);
    }

    #[test]
    fn test_extensions_are_normalized() {
        let config = parse_config(
            "[db]\npath = \"x.sqlite\"\n[index]\nextensions = [\".RS\", \"py\"]\n",
        )
        .unwrap();
        assert_eq!(config.pipeline_config().extensions, vec!["rs", "py"]);
    }

    #[test]
    fn test_rejects_overlap_not_below_window() {
        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[chunking]\nwindow_lines = 10\noverlap_lines = 10\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_lines"));
    }

    #[test]
    fn test_remote_provider_requires_model_and_dims() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"openai\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));

        let err = parse_config(
            "[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"ollama\"\ndims = 768\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("embedding.model"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse_config("[db]\npath = \"x.sqlite\"\n[embedding]\nprovider = \"magic\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("Unknown embedding provider"));
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = load_config(Path::new("/nonexistent/chx.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/chx.toml"));
    }
}
