//! Git adapter for the baseline manager.
//!
//! The engine resets, cleans, and commits deterministically, so we keep a
//! small, explicit wrapper around `git` subprocess calls.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Full SHA of HEAD (errors when the repository has no commits).
    pub fn head_commit(&self) -> Result<String> {
        self.rev_parse("HEAD")
            .context("resolve HEAD (repository needs at least one commit)")
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    pub fn rev_parse(&self, rev: &str) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--verify", "--quiet", rev])?;
        Ok(out.trim().to_string())
    }

    /// Tree object id of a commit.
    pub fn tree_of(&self, commit: &str) -> Result<String> {
        self.rev_parse(&format!("{commit}^{{tree}}"))
    }

    /// First parent of a commit, or `None` for a root commit.
    pub fn commit_parent(&self, commit: &str) -> Result<Option<String>> {
        let out = self.run_capture(&["rev-list", "--parents", "-n", "1", commit])?;
        Ok(out.split_whitespace().nth(1).map(str::to_string))
    }

    /// Number of commits reachable from `to` but not from `from`.
    pub fn count_commits(&self, from: &str, to: &str) -> Result<usize> {
        let range = format!("{from}..{to}");
        let out = self.run_capture(&["rev-list", "--count", &range])?;
        out.trim()
            .parse()
            .with_context(|| format!("parse rev-list count '{}'", out.trim()))
    }

    /// Tree hash of the working tree as `git add -A` would see it.
    ///
    /// Uses a scratch index so the real index is never touched. Ignored files
    /// do not contribute.
    #[instrument(skip_all)]
    pub fn worktree_tree_hash(&self) -> Result<String> {
        let scratch = tempfile::tempdir().context("create scratch index dir")?;
        let index = scratch.path().join("index");
        let env = [("GIT_INDEX_FILE", index.as_path())];
        self.run_checked_env(&["read-tree", "HEAD"], &env)?;
        self.run_checked_env(&["add", "-A"], &env)?;
        let out = self.run_checked_env(&["write-tree"], &env)?;
        let tree = String::from_utf8_lossy(&out.stdout).trim().to_string();
        debug!(tree = %tree, "worktree tree hash");
        Ok(tree)
    }

    /// Get status entries (including untracked) in porcelain format.
    ///
    /// Uses NUL-separated output so paths are never quoted or escaped.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-z", "-uall"])?;
        parse_status_records(&out)
    }

    /// Ensure the worktree is fully clean (including untracked files).
    #[instrument(skip_all)]
    pub fn ensure_clean(&self) -> Result<()> {
        let entries = self.status_porcelain()?;
        if entries.is_empty() {
            debug!("worktree is clean");
            return Ok(());
        }
        warn!(dirty_count = entries.len(), "worktree not clean");
        let mut msg = String::from("working tree not clean:\n");
        for entry in entries {
            msg.push_str(&format!("{} {}\n", entry.code, entry.path));
        }
        Err(anyhow!(msg.trim_end().to_string()))
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    /// Checkout an existing branch.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Reset index and worktree to `commit`.
    #[instrument(skip_all, fields(commit))]
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", commit])?;
        Ok(())
    }

    /// Unstage everything, leaving the worktree alone.
    pub fn reset_index(&self) -> Result<()> {
        self.run_checked(&["reset", "--quiet"])?;
        Ok(())
    }

    /// Remove untracked files and directories; ignored files are preserved.
    pub fn clean_untracked(&self) -> Result<()> {
        self.run_checked(&["clean", "-fd", "--quiet"])?;
        Ok(())
    }

    /// Stage exactly `paths` (additions, modifications, and deletions).
    pub fn add_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add", "-A", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Paths staged relative to HEAD.
    pub fn staged_paths(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--cached", "--name-only", "-z", "--no-renames"])?;
        Ok(out
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Restore tracked `paths` in index and worktree to their state at `commit`.
    ///
    /// Paths absent from `commit` are removed.
    pub fn restore_paths(&self, commit: &str, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let source = format!("--source={commit}");
        let mut args = vec!["restore", source.as_str(), "--staged", "--worktree", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Remove the given untracked `paths`.
    pub fn clean_paths(&self, paths: &[String]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["clean", "-f", "--quiet", "--"];
        args.extend(paths.iter().map(String::as_str));
        self.run_checked(&args)?;
        Ok(())
    }

    /// Commit whatever is staged, even if nothing is.
    #[instrument(skip_all)]
    pub fn commit_allow_empty(&self, message: &str) -> Result<String> {
        debug!("committing staged changes");
        self.run_checked(&["commit", "--allow-empty", "--no-verify", "--quiet", "-m", message])?;
        self.head_commit()
    }

    /// Add `pattern` to `.git/info/exclude` if it is not already listed.
    pub fn ensure_excluded(&self, pattern: &str) -> Result<()> {
        let git_dir = self.run_capture(&["rev-parse", "--git-dir"])?;
        let git_dir = self.workdir.join(git_dir.trim());
        let info_dir = git_dir.join("info");
        fs::create_dir_all(&info_dir)
            .with_context(|| format!("create {}", info_dir.display()))?;
        let exclude = info_dir.join("exclude");
        let existing = match fs::read_to_string(&exclude) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err).with_context(|| format!("read {}", exclude.display())),
        };
        if existing.lines().any(|line| line.trim() == pattern) {
            return Ok(());
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&exclude)
            .with_context(|| format!("open {}", exclude.display()))?;
        let sep = if existing.is_empty() || existing.ends_with('\n') {
            ""
        } else {
            "\n"
        };
        writeln!(file, "{sep}{pattern}").with_context(|| format!("append {}", exclude.display()))?;
        debug!(pattern, "added git exclude");
        Ok(())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        self.run_checked_env(args, &[])
    }

    fn run_checked_env(&self, args: &[&str], env: &[(&str, &Path)]) -> Result<Output> {
        let output = self.run_env(args, env)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        self.run_env(args, &[])
    }

    fn run_env(&self, args: &[&str], env: &[(&str, &Path)]) -> Result<Output> {
        let mut cmd = Command::new("git");
        cmd.args(args).current_dir(&self.workdir);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Parse `git status --porcelain=v1 -z` output.
///
/// Records are `XY path`; renames and copies carry their source path as an
/// extra record, which is skipped.
fn parse_status_records(out: &str) -> Result<Vec<StatusEntry>> {
    let mut entries = Vec::new();
    let mut records = out.split('\0').filter(|record| !record.is_empty());
    while let Some(record) = records.next() {
        let (code, path) = match (record.get(..2), record.get(3..)) {
            (Some(code), Some(path)) if record.as_bytes()[2] == b' ' && !path.is_empty() => {
                (code, path)
            }
            _ => return Err(anyhow!("unexpected porcelain record: '{record}'")),
        };
        if code.contains(['R', 'C']) {
            records
                .next()
                .ok_or_else(|| anyhow!("missing source path for '{record}'"))?;
        }
        entries.push(StatusEntry {
            code: code.to_string(),
            path: path.to_string(),
        });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;

    #[test]
    fn parses_untracked_and_modified_records() {
        let entries = parse_status_records("?? foo.txt\0 M src/main.rs\0").expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].code, "??");
        assert_eq!(entries[0].path, "foo.txt");
        assert_eq!(entries[1].code, " M");
        assert_eq!(entries[1].path, "src/main.rs");
    }

    #[test]
    fn rename_record_uses_new_path_and_skips_source() {
        let entries =
            parse_status_records("R  new -> name.txt\0old.txt\0?? x\0").expect("parse");
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, "new -> name.txt");
        assert_eq!(entries[1].path, "x");
    }

    #[test]
    fn rejects_malformed_record() {
        assert!(parse_status_records("M\0").is_err());
    }

    #[test]
    fn status_and_staged_paths_keep_non_ascii_names_verbatim() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        repo.write("café.txt", "au lait\n").expect("write");
        repo.write("dir with space/naïve.md", "x\n").expect("write");
        let mut paths: Vec<String> = git
            .status_porcelain()
            .expect("status")
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        paths.sort();
        assert_eq!(paths, vec!["café.txt", "dir with space/naïve.md"]);

        git.add_paths(&["café.txt".to_string()]).expect("add");
        assert_eq!(git.staged_paths().expect("staged"), vec!["café.txt"]);
    }

    #[test]
    fn restore_and_clean_paths_discard_selected_changes() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let head = git.head_commit().expect("head");
        repo.write("README.md", "changed\n").expect("write");
        repo.write("keep.txt", "keep\n").expect("write");
        repo.write("drop.txt", "drop\n").expect("write");
        git.restore_paths(&head, &["README.md".to_string()]).expect("restore");
        git.clean_paths(&["drop.txt".to_string()]).expect("clean");
        let status = git.status_porcelain().expect("status");
        assert_eq!(status.len(), 1);
        assert_eq!(status[0].path, "keep.txt");
    }

    #[test]
    fn tree_hash_of_clean_worktree_matches_head() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let head = git.head_commit().expect("head");
        assert_eq!(
            git.worktree_tree_hash().expect("worktree hash"),
            git.tree_of(&head).expect("head tree")
        );
    }

    #[test]
    fn tree_hash_sees_untracked_files_without_staging_them() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let before = git.worktree_tree_hash().expect("hash");
        repo.write("new.txt", "hello").expect("write");
        let after = git.worktree_tree_hash().expect("hash");
        assert_ne!(before, after);
        assert!(git.staged_paths().expect("staged").is_empty());
    }

    #[test]
    fn excluded_paths_survive_clean_and_do_not_change_tree_hash() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let before = git.worktree_tree_hash().expect("hash");
        git.ensure_excluded(".workorder/").expect("exclude");
        git.ensure_excluded(".workorder/").expect("exclude twice");
        repo.write(".workorder/runs/log.txt", "x").expect("write");
        git.clean_untracked().expect("clean");
        assert!(repo.path().join(".workorder/runs/log.txt").exists());
        assert_eq!(git.worktree_tree_hash().expect("hash"), before);
        git.ensure_clean().expect("excluded files do not dirty status");
    }

    #[test]
    fn commit_parent_and_count() {
        let repo = TestRepo::new().expect("repo");
        let git = repo.git();
        let base = git.head_commit().expect("head");
        let next = git.commit_allow_empty("empty").expect("commit");
        assert_eq!(git.commit_parent(&next).expect("parent"), Some(base.clone()));
        assert_eq!(git.count_commits(&base, &next).expect("count"), 1);
    }
}
