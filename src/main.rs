//! # Code Harness CLI (`chx`)
//!
//! ## Usage
//!
//! ```bash
//! chx --config ./config/chx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `chx init` | Create the SQLite database and run schema migrations |
//! | `chx index` | Bring the index up to date with the working tree |
//! | `chx index --staged` | Index the staging area instead |
//! | `chx index --rev <REV>` | Index a commit, branch, or tag |
//! | `chx search "<query>"` | Hybrid lexical + semantic search |
//! | `chx status` | Show what is indexed |
//!
//! ## Examples
//!
//! ```bash
//! chx init
//! chx index
//! chx index --path 'src/**' --json
//! chx search "parse config" --lang rust --explain
//! RUST_LOG=code_harness_core=debug chx index --force
//! ```

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use code_harness::config;
use code_harness::index_cmd::{self, IndexOptions};
use code_harness::migrate;
use code_harness::search::{self, SearchOptions};
use code_harness::status;
use code_harness_core::models::SyncMode;

/// Code Harness CLI: incremental code indexing with hybrid search.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/chx.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "chx",
    about = "Code Harness: incremental code indexing with hybrid lexical + semantic search",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/chx.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent; running it multiple times is safe.
    Init,

    /// Index the repository.
    ///
    /// Resolves the selected tree, diffs it against the last indexed tree,
    /// and re-chunks and re-embeds only changed files. The first run (or
    /// `--force`) indexes everything.
    Index {
        /// Index the staging area instead of the working tree.
        #[arg(long, conflicts_with = "rev")]
        staged: bool,

        /// Index a revision (commit, branch, or tag).
        #[arg(long)]
        rev: Option<String>,

        /// Limit the run to paths matching this glob. Repeatable.
        #[arg(long = "path")]
        paths: Vec<String>,

        /// Reindex everything, also after an embedding model change.
        #[arg(long)]
        force: bool,

        /// Repository root (overrides `index.root`).
        #[arg(long)]
        root: Option<PathBuf>,

        /// Print the run report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Search indexed code.
    Search {
        /// The search query string.
        query: String,

        /// Maximum number of results to return.
        #[arg(long)]
        limit: Option<usize>,

        /// Only return chunks whose path matches this glob.
        #[arg(long)]
        path: Option<String>,

        /// Only return chunks of this language (e.g. `rust`, `python`).
        #[arg(long)]
        lang: Option<String>,

        /// Show per-list scores and candidate counts.
        #[arg(long)]
        explain: bool,

        /// Print results as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Show index status.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so `--json` output on stdout stays parseable.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Index {
            staged,
            rev,
            paths,
            force,
            root,
            json,
        } => {
            let mode = match (staged, rev) {
                (true, _) => SyncMode::Staged,
                (false, Some(rev)) => SyncMode::Revision(rev),
                (false, None) => SyncMode::Worktree,
            };
            let opts = IndexOptions {
                mode,
                paths,
                force,
                json,
                root,
            };
            index_cmd::run_index(&cfg, &opts).await?;
        }
        Commands::Search {
            query,
            limit,
            path,
            lang,
            explain,
            json,
        } => {
            let opts = SearchOptions {
                limit,
                path,
                lang,
                explain,
                json,
            };
            search::run_search(&cfg, &query, &opts).await?;
        }
        Commands::Status => {
            status::run_status(&cfg).await?;
        }
    }

    Ok(())
}
