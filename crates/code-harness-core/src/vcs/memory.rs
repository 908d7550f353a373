//! In-process repository implementing [`Vcs`].
//!
//! Models the three states the pipeline can index: a working tree, a
//! staging area, and named commits. Every snapshot is stored under a
//! content-addressed tree id, so resolving an unchanged working tree twice
//! yields the same id.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use sha2::{Digest, Sha256};

use super::Vcs;
use crate::models::{ChangeStatus, FileChange, SyncMode, TreeId, STAGED_REV, WORKTREE_REV};

type Snapshot = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct Repo {
    worktree: Snapshot,
    staged: Snapshot,
    /// name -> (commit id, tree id)
    commits: HashMap<String, (String, TreeId)>,
    trees: HashMap<TreeId, Snapshot>,
    unreadable: HashSet<String>,
}

impl Repo {
    fn store(&mut self, snapshot: Snapshot) -> TreeId {
        let mut hasher = Sha256::new();
        for (path, bytes) in &snapshot {
            hasher.update(path.as_bytes());
            hasher.update([0]);
            hasher.update(Sha256::digest(bytes));
        }
        let id = TreeId::new(hex::encode(hasher.finalize()));
        self.trees.entry(id.clone()).or_insert(snapshot);
        id
    }

    fn tree(&self, id: &TreeId) -> Result<&Snapshot> {
        self.trees
            .get(id)
            .ok_or_else(|| anyhow!("unknown tree {id}"))
    }
}

/// An in-memory repository for tests.
#[derive(Default)]
pub struct MemoryVcs {
    repo: RwLock<Repo>,
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("memory vcs lock poisoned")
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a file into the working tree.
    pub fn write(&self, path: &str, content: impl Into<Vec<u8>>) -> Result<()> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        repo.worktree.insert(path.to_string(), content.into());
        Ok(())
    }

    /// Remove a file from the working tree.
    pub fn remove(&self, path: &str) -> Result<()> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        repo.worktree.remove(path);
        Ok(())
    }

    /// Move a file within the working tree.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        let bytes = repo
            .worktree
            .remove(from)
            .ok_or_else(|| anyhow!("no such file: {from}"))?;
        repo.worktree.insert(to.to_string(), bytes);
        Ok(())
    }

    /// Copy the working tree into the staging area.
    pub fn stage_all(&self) -> Result<()> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        repo.staged = repo.worktree.clone();
        Ok(())
    }

    /// Record the staging area as a named commit.
    pub fn commit(&self, name: &str) -> Result<TreeId> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        let snapshot = repo.staged.clone();
        let tree = repo.store(snapshot);
        let commit_id = hex::encode(Sha256::digest(format!("{name}\0{tree}").as_bytes()));
        repo.commits.insert(name.to_string(), (commit_id, tree.clone()));
        Ok(tree)
    }

    /// Make reads of `path` fail, at any tree.
    pub fn make_unreadable(&self, path: &str) -> Result<()> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        repo.unreadable.insert(path.to_string());
        Ok(())
    }
}

impl Vcs for MemoryVcs {
    fn resolve_tree(&self, mode: &SyncMode) -> Result<TreeId> {
        let mut repo = self.repo.write().map_err(poisoned)?;
        match mode {
            SyncMode::Worktree => {
                let snapshot = repo.worktree.clone();
                Ok(repo.store(snapshot))
            }
            SyncMode::Staged => {
                let snapshot = repo.staged.clone();
                Ok(repo.store(snapshot))
            }
            SyncMode::Revision(rev) => repo
                .commits
                .get(rev)
                .map(|(_, tree)| tree.clone())
                .ok_or_else(|| anyhow!("unknown revision '{rev}'")),
        }
    }

    fn rev_label(&self, mode: &SyncMode) -> Result<String> {
        match mode {
            SyncMode::Worktree => Ok(WORKTREE_REV.to_string()),
            SyncMode::Staged => Ok(STAGED_REV.to_string()),
            SyncMode::Revision(rev) => {
                let repo = self.repo.read().map_err(poisoned)?;
                repo.commits
                    .get(rev)
                    .map(|(commit, _)| commit.clone())
                    .ok_or_else(|| anyhow!("unknown revision '{rev}'"))
            }
        }
    }

    fn diff(&self, from: Option<&TreeId>, to: &TreeId) -> Result<Vec<FileChange>> {
        let repo = self.repo.read().map_err(poisoned)?;
        let empty = Snapshot::new();
        let old = match from {
            Some(id) => repo.tree(id)?,
            None => &empty,
        };
        let new = repo.tree(to)?;

        let mut added: Vec<&String> = Vec::new();
        let mut deleted: Vec<&String> = Vec::new();
        let mut changes = Vec::new();

        for (path, bytes) in new {
            match old.get(path) {
                None => added.push(path),
                Some(prev) if prev != bytes => {
                    changes.push(FileChange::new(ChangeStatus::Modified, path.clone()));
                }
                Some(_) => {}
            }
        }
        for path in old.keys() {
            if !new.contains_key(path) {
                deleted.push(path);
            }
        }

        // Exact-content renames, like `git diff -M100%`.
        let mut renamed_to: HashSet<&String> = HashSet::new();
        for old_path in deleted {
            let old_bytes = &old[old_path];
            let target = added
                .iter()
                .find(|p| !renamed_to.contains(*p) && &new[**p] == old_bytes)
                .copied();
            match target {
                Some(new_path) => {
                    renamed_to.insert(new_path);
                    changes.push(FileChange::renamed(old_path.clone(), new_path.clone()));
                }
                None => changes.push(FileChange::new(ChangeStatus::Deleted, old_path.clone())),
            }
        }
        for path in added {
            if !renamed_to.contains(path) {
                changes.push(FileChange::new(ChangeStatus::Added, path.clone()));
            }
        }

        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn list_tracked_files(&self, tree: &TreeId) -> Result<Vec<String>> {
        let repo = self.repo.read().map_err(poisoned)?;
        Ok(repo.tree(tree)?.keys().cloned().collect())
    }

    fn read_at(&self, path: &str, tree: &TreeId) -> Result<Vec<u8>> {
        let repo = self.repo.read().map_err(poisoned)?;
        if repo.unreadable.contains(path) {
            bail!("permission denied: {path}");
        }
        repo.tree(tree)?
            .get(path)
            .cloned()
            .ok_or_else(|| anyhow!("{path} does not exist in tree {tree}"))
    }
}
