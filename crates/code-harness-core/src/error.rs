//! Error taxonomy for indexing and retrieval runs.
//!
//! Ports return `anyhow::Result` so backends can attach whatever context
//! they like; the pipeline and the search engine fold those errors into
//! one of the categories below before surfacing them to the caller.

/// Errors that abort an indexing run or a query.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// Stored vectors were produced by a different embedding configuration.
    #[error(
        "embedding model mismatch: index was built with '{stored}' but the current model is \
         '{current}'; re-run with --force to rebuild the index"
    )]
    ModelMismatch { stored: String, current: String },

    /// A file could not be read at the target tree.
    #[error("I/O error reading {path}: {message}")]
    Io { path: String, message: String },

    /// The embedding service failed.
    #[error("embedding error: {0}")]
    Embedding(String),

    /// The VCS adapter failed to resolve, diff, or list a tree.
    #[error("VCS error: {0}")]
    Vcs(String),

    /// A storage backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A search backend rejected or failed a query.
    #[error("search error: {0}")]
    Search(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl IndexError {
    /// Stable category name, suitable for logs and machine-readable output.
    #[must_use]
    pub fn category(&self) -> &'static str {
        match self {
            Self::ModelMismatch { .. } => "model_mismatch",
            Self::Io { .. } => "io",
            Self::Embedding(_) => "embedding",
            Self::Vcs(_) => "vcs",
            Self::Storage(_) => "storage",
            Self::Search(_) => "search",
            Self::Internal(_) => "internal",
        }
    }

    pub(crate) fn io(path: &str, err: &anyhow::Error) -> Self {
        Self::Io {
            path: path.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub(crate) fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    pub(crate) fn embedding(err: &anyhow::Error) -> Self {
        Self::Embedding(format!("{err:#}"))
    }

    pub(crate) fn vcs(err: &anyhow::Error) -> Self {
        Self::Vcs(format!("{err:#}"))
    }

    pub(crate) fn search(err: &anyhow::Error) -> Self {
        Self::Search(format!("{err:#}"))
    }
}

/// Result type alias using [`IndexError`].
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_mismatch_message_names_both_fingerprints() {
        let err = IndexError::ModelMismatch {
            stored: "openai/a@3".into(),
            current: "openai/b@3".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("openai/a@3"));
        assert!(msg.contains("openai/b@3"));
        assert!(msg.contains("--force"));
        assert_eq!(err.category(), "model_mismatch");
    }

    #[test]
    fn io_error_carries_path() {
        let err = IndexError::io("src/lib.rs", &anyhow::anyhow!("permission denied"));
        assert_eq!(err.category(), "io");
        assert!(err.to_string().contains("src/lib.rs"));
        assert!(err.to_string().contains("permission denied"));
    }
}
