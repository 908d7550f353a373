//! Git-backed [`Vcs`] implementation.
//!
//! Shells out to the `git` binary; no libgit2. Every sync mode resolves
//! to a real git tree object so that an unchanged snapshot always yields
//! the same tree id:
//!
//! - **worktree**: a throwaway index (`GIT_INDEX_FILE`) seeded from the
//!   real one, `git add -A`, then `git write-tree`. The user's index is
//!   never touched.
//! - **staged**: `git write-tree` on the real index.
//! - **revision**: `git rev-parse <rev>^{tree}`.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::warn;

use code_harness_core::models::{
    ChangeStatus, FileChange, SyncMode, TreeId, STAGED_REV, WORKTREE_REV,
};
use code_harness_core::vcs::Vcs;

/// A git repository on disk.
pub struct GitVcs {
    root: PathBuf,
}

impl GitVcs {
    /// Open the repository containing `root`.
    pub fn open(root: &Path) -> Result<Self> {
        let output = Command::new("git")
            .args(["rev-parse", "--show-toplevel"])
            .current_dir(root)
            .output()
            .with_context(|| "Failed to execute 'git rev-parse'. Is git installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} is not a git repository: {}", root.display(), stderr.trim());
        }

        let toplevel = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok(Self {
            root: PathBuf::from(toplevel),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn git(&self, args: &[&str]) -> Result<Output> {
        self.git_with_index(None, args)
    }

    fn git_line(&self, args: &[&str]) -> Result<String> {
        let output = self.git(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn git_path(&self, name: &str) -> Result<PathBuf> {
        let path = PathBuf::from(self.git_line(&["rev-parse", "--git-path", name])?);
        Ok(if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        })
    }

    fn git_with_index(&self, index: Option<&Path>, args: &[&str]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.root);
        if let Some(index) = index {
            cmd.env("GIT_INDEX_FILE", index);
        }

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute 'git {}'", args.join(" ")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("git {} failed: {}", args.join(" "), stderr.trim());
        }

        Ok(output)
    }

    /// Tree of the working directory, including untracked files that are
    /// not ignored.
    fn worktree_tree(&self) -> Result<TreeId> {
        let index = self.git_path("index")?;
        let scratch = self.git_path(&format!("chx-index-{}", std::process::id()))?;

        if index.exists() {
            std::fs::copy(&index, &scratch)
                .with_context(|| format!("Failed to copy git index to {}", scratch.display()))?;
        }

        let result = self
            .git_with_index(Some(scratch.as_path()), &["add", "-A"])
            .and_then(|_| self.git_with_index(Some(scratch.as_path()), &["write-tree"]))
            .map(|output| TreeId::new(String::from_utf8_lossy(&output.stdout).trim()));

        let _ = std::fs::remove_file(&scratch);
        result
    }
}

impl Vcs for GitVcs {
    fn resolve_tree(&self, mode: &SyncMode) -> Result<TreeId> {
        match mode {
            SyncMode::Worktree => self.worktree_tree(),
            SyncMode::Staged => Ok(TreeId::new(self.git_line(&["write-tree"])?)),
            SyncMode::Revision(rev) => {
                let spec = format!("{rev}^{{tree}}");
                Ok(TreeId::new(self.git_line(&["rev-parse", "--verify", &spec])?))
            }
        }
    }

    fn rev_label(&self, mode: &SyncMode) -> Result<String> {
        match mode {
            SyncMode::Worktree => Ok(WORKTREE_REV.to_string()),
            SyncMode::Staged => Ok(STAGED_REV.to_string()),
            SyncMode::Revision(rev) => {
                let spec = format!("{rev}^{{commit}}");
                self.git_line(&["rev-parse", "--verify", &spec])
            }
        }
    }

    fn diff(&self, from: Option<&TreeId>, to: &TreeId) -> Result<Vec<FileChange>> {
        let Some(from) = from else {
            return Ok(self
                .list_tracked_files(to)?
                .into_iter()
                .map(|p| FileChange::new(ChangeStatus::Added, p))
                .collect());
        };

        let output = self.git(&[
            "diff-tree",
            "-r",
            "-M",
            "--name-status",
            "-z",
            from.as_str(),
            to.as_str(),
        ])?;
        parse_name_status(&output.stdout)
    }

    fn list_tracked_files(&self, tree: &TreeId) -> Result<Vec<String>> {
        let output = self.git(&["ls-tree", "-r", "-z", "--name-only", tree.as_str()])?;
        let mut paths: Vec<String> = split_nul(&output.stdout)
            .filter_map(utf8_path)
            .map(str::to_string)
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn read_at(&self, path: &str, tree: &TreeId) -> Result<Vec<u8>> {
        let object = format!("{}:{}", tree.as_str(), path);
        Ok(self.git(&["cat-file", "blob", &object])?.stdout)
    }
}

fn split_nul(bytes: &[u8]) -> impl Iterator<Item = &[u8]> + '_ {
    bytes.split(|b| *b == 0).filter(|s| !s.is_empty())
}

/// Paths that are not valid UTF-8 are never indexed.
fn utf8_path(raw: &[u8]) -> Option<&str> {
    match std::str::from_utf8(raw) {
        Ok(path) => Some(path),
        Err(_) => {
            warn!(path = %String::from_utf8_lossy(raw), "skipping path that is not valid UTF-8");
            None
        }
    }
}

/// Parse `git diff-tree --name-status -z` output.
///
/// Records are `STATUS\0PATH\0`, or `RNNN\0OLD\0NEW\0` for renames and
/// copies. Copies are reported as additions of the new path. A record
/// whose path is not valid UTF-8 is skipped whole; for a rename, only the
/// valid side is kept.
fn parse_name_status(bytes: &[u8]) -> Result<Vec<FileChange>> {
    let mut fields = split_nul(bytes);
    let mut changes = Vec::new();

    while let Some(raw_status) = fields.next() {
        let status = String::from_utf8_lossy(raw_status);
        let Some(raw_path) = fields.next() else {
            bail!("truncated diff-tree output after status '{}'", status);
        };
        let path = utf8_path(raw_path);
        let change = match status.chars().next() {
            Some('A') => path.map(|p| FileChange::new(ChangeStatus::Added, p)),
            Some('M') | Some('T') => path.map(|p| FileChange::new(ChangeStatus::Modified, p)),
            Some('D') => path.map(|p| FileChange::new(ChangeStatus::Deleted, p)),
            Some(kind @ ('R' | 'C')) => {
                let Some(raw_new) = fields.next() else {
                    bail!(
                        "truncated diff-tree output for rename of '{}'",
                        String::from_utf8_lossy(raw_path)
                    );
                };
                match (kind, path, utf8_path(raw_new)) {
                    ('R', Some(old), Some(new)) => Some(FileChange::renamed(old, new)),
                    ('R', Some(old), None) => Some(FileChange::new(ChangeStatus::Deleted, old)),
                    (_, _, Some(new)) => Some(FileChange::new(ChangeStatus::Added, new)),
                    (_, _, None) => None,
                }
            }
            _ => bail!(
                "unexpected diff-tree status '{}' for '{}'",
                status,
                String::from_utf8_lossy(raw_path)
            ),
        };
        changes.extend(change);
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn run(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?}: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn init_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        run(dir.path(), &["init", "-q"]);
        run(dir.path(), &["config", "user.email", "test@example.com"]);
        run(dir.path(), &["config", "user.name", "Test"]);
        run(dir.path(), &["config", "commit.gpgsign", "false"]);
        dir
    }

    fn write(dir: &Path, path: &str, content: &str) {
        let full = dir.join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, content).unwrap();
    }

    #[test]
    fn test_parse_name_status() {
        let raw = b"M\0src/b.rs\0R100\0old.rs\0src/new.rs\0D\0gone.rs\0A\0src/a.rs\0C75\0x.rs\0y.rs\0";
        let changes = parse_name_status(raw).unwrap();
        assert_eq!(
            changes,
            vec![
                FileChange::new(ChangeStatus::Deleted, "gone.rs"),
                FileChange::new(ChangeStatus::Added, "src/a.rs"),
                FileChange::new(ChangeStatus::Modified, "src/b.rs"),
                FileChange::renamed("old.rs", "src/new.rs"),
                FileChange::new(ChangeStatus::Added, "y.rs"),
            ]
        );
        assert!(parse_name_status(b"R100\0only-old.rs\0").is_err());
    }

    #[test]
    fn test_parse_name_status_skips_non_utf8_paths() {
        let raw = b"M\0src/\xff\xfe.rs\0A\0src/ok.rs\0R090\0old.rs\0new\xff.rs\0R100\0\xffa.rs\0b.rs\0";
        let changes = parse_name_status(raw).unwrap();
        assert_eq!(
            changes,
            vec![
                FileChange::new(ChangeStatus::Added, "b.rs"),
                FileChange::new(ChangeStatus::Deleted, "old.rs"),
                FileChange::new(ChangeStatus::Added, "src/ok.rs"),
            ]
        );
    }

    #[test]
    fn test_worktree_tree_is_content_addressed() {
        if !git_available() {
            return;
        }
        let repo = init_repo();
        write(repo.path(), "src/lib.rs", "pub fn a() {}\n");
        let vcs = GitVcs::open(repo.path()).unwrap();

        let t1 = vcs.resolve_tree(&SyncMode::Worktree).unwrap();
        let t2 = vcs.resolve_tree(&SyncMode::Worktree).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(vcs.list_tracked_files(&t1).unwrap(), vec!["src/lib.rs"]);
        assert_eq!(
            vcs.read_at("src/lib.rs", &t1).unwrap(),
            b"pub fn a() {}\n".to_vec()
        );

        // Untracked files are picked up without touching the real index.
        let staged = vcs.resolve_tree(&SyncMode::Staged).unwrap();
        assert!(vcs.list_tracked_files(&staged).unwrap().is_empty());

        write(repo.path(), "src/lib.rs", "pub fn b() {}\n");
        let t3 = vcs.resolve_tree(&SyncMode::Worktree).unwrap();
        assert_ne!(t1, t3);
        assert_eq!(
            vcs.diff(Some(&t1), &t3).unwrap(),
            vec![FileChange::new(ChangeStatus::Modified, "src/lib.rs")]
        );
    }

    #[test]
    fn test_revision_mode_and_renames() {
        if !git_available() {
            return;
        }
        let repo = init_repo();
        let body = "fn stable() {\n    let value = 1;\n    println!(\"{}\", value);\n}\n";
        write(repo.path(), "a.rs", body);
        run(repo.path(), &["add", "-A"]);
        run(repo.path(), &["commit", "-q", "-m", "one"]);

        let vcs = GitVcs::open(repo.path()).unwrap();
        let head = SyncMode::Revision("HEAD".to_string());
        let t1 = vcs.resolve_tree(&head).unwrap();
        let label = vcs.rev_label(&head).unwrap();
        assert_eq!(label.len(), 40);
        assert_ne!(label, t1.as_str());

        run(repo.path(), &["mv", "a.rs", "b.rs"]);
        run(repo.path(), &["commit", "-q", "-m", "two"]);
        let t2 = vcs.resolve_tree(&head).unwrap();
        assert_eq!(
            vcs.diff(Some(&t1), &t2).unwrap(),
            vec![FileChange::renamed("a.rs", "b.rs")]
        );

        let all = vcs.diff(None, &t2).unwrap();
        assert_eq!(all, vec![FileChange::new(ChangeStatus::Added, "b.rs")]);
        assert!(vcs.read_at("a.rs", &t2).is_err());
    }

    #[test]
    fn test_open_rejects_non_repository() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        assert!(GitVcs::open(dir.path()).is_err());
    }
}
