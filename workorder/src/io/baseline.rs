//! Baseline manager: the only component that moves HEAD or resets the tree.

use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;

/// Known-good starting point of one work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Baseline {
    pub commit: String,
    pub tree: String,
    pub branch: String,
}

#[derive(Debug, Clone)]
pub struct BaselineManager {
    git: Git,
}

impl BaselineManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            git: Git::new(root),
        }
    }

    pub fn git(&self) -> &Git {
        &self.git
    }

    /// Resolve the baseline: a checked-out branch with a clean tree.
    #[instrument(skip_all)]
    pub fn snapshot(&self) -> Result<Baseline> {
        let branch = self.git.current_branch()?;
        let commit = self.git.head_commit()?;
        self.git
            .ensure_clean()
            .context("baseline requires a clean working tree")?;
        let tree = self.git.tree_of(&commit)?;
        debug!(commit = %commit, tree = %tree, branch = %branch, "baseline resolved");
        Ok(Baseline {
            commit,
            tree,
            branch,
        })
    }

    /// Tree hash of the current working tree content.
    pub fn tree_hash(&self) -> Result<String> {
        self.git.worktree_tree_hash()
    }

    /// Restore the working tree to the baseline byte for byte.
    ///
    /// Ignored files are preserved. Fails if the restored tree hash differs
    /// from the baseline or anything is left dirty.
    #[instrument(skip_all, fields(commit = %baseline.commit))]
    pub fn rollback(&self, baseline: &Baseline) -> Result<()> {
        self.git.reset_hard(&baseline.commit)?;
        self.git.clean_untracked()?;
        self.verify_restored(baseline)?;
        info!("rolled back to baseline");
        Ok(())
    }

    /// Commit exactly `paths` on top of the baseline and return the new commit.
    ///
    /// Changes outside `paths` (verification byproducts) are discarded first.
    /// The result has the baseline as its only parent.
    #[instrument(skip_all, fields(commit = %baseline.commit, paths = paths.len()))]
    pub fn commit(&self, baseline: &Baseline, paths: &[String], message: &str) -> Result<String> {
        let head = self.git.head_commit()?;
        if head != baseline.commit {
            bail!(
                "HEAD moved during the attempt (expected {}, found {head})",
                baseline.commit
            );
        }
        let branch = self.git.current_branch()?;
        if branch != baseline.branch {
            bail!(
                "branch changed during the attempt (expected {}, found {branch})",
                baseline.branch
            );
        }

        self.discard_outside(baseline, paths)?;

        self.git.reset_index()?;
        self.git.add_paths(paths)?;
        let staged = self.git.staged_paths()?;
        if let Some(extra) = staged.iter().find(|path| !paths.contains(path)) {
            bail!("staged path {extra} is outside the write set");
        }

        let commit = self.git.commit_allow_empty(message)?;
        let parent = self.git.commit_parent(&commit)?;
        if parent.as_deref() != Some(baseline.commit.as_str()) {
            return Err(anyhow!(
                "new commit {commit} does not have the baseline {} as parent",
                baseline.commit
            ));
        }
        self.git
            .ensure_clean()
            .context("working tree dirty after commit")?;
        info!(commit = %commit, "committed write set");
        Ok(commit)
    }

    /// Return every path outside `paths` to its baseline state: tracked
    /// changes are restored, untracked files removed. Ignored files stay.
    fn discard_outside(&self, baseline: &Baseline, paths: &[String]) -> Result<()> {
        let (untracked, tracked): (Vec<_>, Vec<_>) = self
            .git
            .status_porcelain()?
            .into_iter()
            .filter(|entry| !paths.contains(&entry.path))
            .partition(|entry| entry.code == "??");
        if untracked.is_empty() && tracked.is_empty() {
            return Ok(());
        }
        let untracked: Vec<String> = untracked.into_iter().map(|entry| entry.path).collect();
        let tracked: Vec<String> = tracked.into_iter().map(|entry| entry.path).collect();
        warn!(
            untracked = ?untracked,
            tracked = ?tracked,
            "discarding changes outside the write set"
        );
        self.git
            .restore_paths(&baseline.commit, &tracked)
            .context("restore tracked paths outside the write set")?;
        self.git
            .clean_paths(&untracked)
            .context("remove untracked paths outside the write set")?;
        Ok(())
    }

    fn verify_restored(&self, baseline: &Baseline) -> Result<()> {
        let tree = self.git.worktree_tree_hash()?;
        if tree != baseline.tree {
            bail!(
                "rollback left tree {tree}, expected baseline tree {}",
                baseline.tree
            );
        }
        self.git
            .ensure_clean()
            .context("working tree dirty after rollback")?;
        Ok(())
    }
}
