//! Persisted repository state.
//!
//! What the last successful index run recorded: which tree it reached,
//! how that tree was selected, and which embedding model produced the
//! stored vectors.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::models::{SyncMode, TreeId};
use crate::store::MetaRepository;

pub const KEY_LAST_TREE_SHA: &str = "last_tree_sha";
pub const KEY_LAST_SYNC_MODE: &str = "last_sync_mode";
pub const KEY_MODEL_FINGERPRINT: &str = "model_fingerprint";
pub const KEY_INDEXED_AT: &str = "indexed_at";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoState {
    pub last_tree_sha: Option<TreeId>,
    pub last_sync_mode: Option<SyncMode>,
    pub model_fingerprint: Option<String>,
    pub indexed_at: Option<DateTime<Utc>>,
}

impl RepoState {
    /// Read the state; missing keys (a fresh index) come back as `None`.
    pub async fn load(meta: &dyn MetaRepository) -> Result<Self> {
        let last_tree_sha = meta.get(KEY_LAST_TREE_SHA).await?.map(TreeId::new);
        let last_sync_mode = meta
            .get(KEY_LAST_SYNC_MODE)
            .await?
            .map(|s| SyncMode::parse(&s));
        let model_fingerprint = meta.get(KEY_MODEL_FINGERPRINT).await?;
        let indexed_at = meta
            .get(KEY_INDEXED_AT)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Self {
            last_tree_sha,
            last_sync_mode,
            model_fingerprint,
            indexed_at,
        })
    }

    /// State after a successful run.
    pub fn reached(tree: &TreeId, mode: &SyncMode, fingerprint: &str) -> Self {
        Self {
            last_tree_sha: Some(tree.clone()),
            last_sync_mode: Some(mode.clone()),
            model_fingerprint: Some(fingerprint.to_string()),
            indexed_at: Some(Utc::now()),
        }
    }

    /// Write every present field in a single `set_many`.
    pub async fn save(&self, meta: &dyn MetaRepository) -> Result<()> {
        let tree = self.last_tree_sha.as_ref().map(|t| t.to_string());
        let mode = self.last_sync_mode.as_ref().map(|m| m.to_string());
        let indexed_at = self.indexed_at.map(|t| t.to_rfc3339());

        let pairs: Vec<(&str, &str)> = [
            (KEY_LAST_TREE_SHA, tree.as_deref()),
            (KEY_LAST_SYNC_MODE, mode.as_deref()),
            (KEY_MODEL_FINGERPRINT, self.model_fingerprint.as_deref()),
            (KEY_INDEXED_AT, indexed_at.as_deref()),
        ]
        .into_iter()
        .filter_map(|(k, v)| v.map(|v| (k, v)))
        .collect();

        meta.set_many(&pairs).await
    }
}
