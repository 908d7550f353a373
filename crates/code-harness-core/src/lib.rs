//! # Code Harness Core
//!
//! Backend-agnostic logic for Code Harness: the chunk model, the ports
//! every backend implements, the incremental indexing pipeline, and the
//! hybrid (lexical + vector) retrieval engine.
//!
//! This crate contains no tokio, sqlx, or process-spawning code. Concrete
//! backends (SQLite, git, HTTP embedding providers) live in the
//! `code-harness` app crate; in-memory implementations of every port live
//! here so the pipeline and ranking can be exercised in isolation.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod lang;
pub mod models;
pub mod pipeline;
pub mod search;
pub mod state;
pub mod store;
pub mod vcs;

pub use error::{IndexError, Result};
