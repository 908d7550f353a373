//! # Code Harness
//!
//! Incremental code indexing with hybrid lexical + semantic search.
//!
//! Code Harness keeps a SQLite index of a git repository's source files in
//! step with the repository: each run resolves a tree (working directory,
//! staging area, or a revision), diffs it against the tree the previous
//! run reached, and re-chunks and re-embeds only what changed. Queries
//! combine FTS5 BM25 and vector similarity with reciprocal rank fusion.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────┐   ┌───────────┐
//! │   git    │──▶│ IndexPipeline    │──▶│  SQLite   │
//! │ (GitVcs) │   │ chunk + embed    │   │ FTS5 + Vec│
//! └──────────┘   └──────────────────┘   └─────┬─────┘
//!                                             │
//!                                             ▼
//!                                      ┌─────────────┐
//!                                      │SearchEngine │──▶ chx search
//!                                      │ BM25 ⊕ RRF  │
//!                                      └─────────────┘
//! ```
//!
//! The pipeline and the engine live in `code-harness-core`; this crate
//! provides the concrete backends and the `chx` CLI.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite implementation of the storage/search ports |
//! | [`git`] | Git implementation of the VCS port |
//! | [`embedding`] | Embedding providers |
//! | [`index_cmd`] | `chx index` |
//! | [`search`] | `chx search` |
//! | [`status`] | `chx status` |

pub mod config;
pub mod db;
pub mod embedding;
pub mod git;
pub mod index_cmd;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod status;
