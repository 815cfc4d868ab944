//! Test-only helpers: scratch git repositories and scripted backends.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use serde_json::json;
use tempfile::TempDir;

use crate::cancel::{CancelToken, Cancelled};
use crate::core::types::{FailureBrief, FailureKind, Stage, Verdict};
use crate::io::git::Git;
use crate::io::oracle::{Oracle, OracleRequest};
use crate::io::verify::{Verifier, VerifyReport, VerifyRequest};

/// Git repository in a temp dir, on `main`, with one commit holding
/// `README.md` and a passing `scripts/verify.sh`.
pub struct TestRepo {
    dir: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let repo = Self {
            dir: tempfile::tempdir().context("create temp dir")?,
        };
        repo.run_git(&["init", "--quiet"])?;
        repo.run_git(&["symbolic-ref", "HEAD", "refs/heads/main"])?;
        repo.run_git(&["config", "user.email", "tests@example.com"])?;
        repo.run_git(&["config", "user.name", "Tests"])?;
        repo.run_git(&["config", "commit.gpgsign", "false"])?;
        repo.write("README.md", "# scratch\n")?;
        repo.write("scripts/verify.sh", "#!/bin/sh\nexit 0\n")?;
        repo.run_git(&["add", "-A"])?;
        repo.run_git(&["commit", "--quiet", "-m", "initial"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn git(&self) -> Git {
        Git::new(self.path())
    }

    /// Write `contents` to `rel`, creating parent directories.
    pub fn write(&self, rel: &str, contents: &str) -> Result<()> {
        let path = self.path().join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<String> {
        let path = self.path().join(rel);
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Write and commit files on the current branch.
    pub fn commit_files(&self, files: &[(&str, &str)], message: &str) -> Result<String> {
        for (rel, contents) in files {
            self.write(rel, contents)?;
        }
        self.run_git(&["add", "-A"])?;
        self.run_git(&["commit", "--quiet", "-m", message])?;
        self.git().head_commit()
    }

    /// Run git in the repository and return trimmed stdout.
    pub fn run_git(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}

/// Fenced oracle response writing `files` (path, content) without base hashes.
pub fn proposal_response(files: &[(&str, &str)]) -> String {
    let files: Vec<_> = files
        .iter()
        .map(|(path, content)| json!({ "path": path, "content": content }))
        .collect();
    fenced(&json!({ "summary": "scripted change", "files": files }))
}

/// Fenced oracle response for one file with an explicit base hash.
pub fn proposal_response_with_hash(path: &str, content: &str, base_hash: Option<&str>) -> String {
    fenced(&json!({
        "files": [{ "path": path, "content": content, "base_hash": base_hash }]
    }))
}

fn fenced(value: &serde_json::Value) -> String {
    format!("Here is the change.\n\n```json\n{value:#}\n```\n")
}

/// One scripted oracle reply.
#[derive(Debug, Clone)]
pub enum Reply {
    Text(String),
    /// Oracle failure (process error, timeout).
    Error(String),
    /// Fire the cancel token and report cancellation.
    Cancel,
}

/// Oracle replaying canned replies in order and recording every request.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for text-only replies.
    pub fn texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(|text| Reply::Text(text.into())))
    }

    pub fn requests(&self) -> Vec<OracleRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or_default()
    }
}

impl Oracle for ScriptedOracle {
    fn propose(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("replies lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted oracle ran out of replies"))?;
        match reply {
            Reply::Text(text) => Ok(text),
            Reply::Error(message) => Err(anyhow!(message)),
            Reply::Cancel => {
                cancel.cancel();
                Err(Cancelled.into())
            }
        }
    }
}

/// One scripted verification outcome.
#[derive(Debug, Clone)]
pub enum Check {
    Pass,
    Fail(String),
    /// The verifier itself errors.
    Broken(String),
}

/// Verifier replaying canned outcomes without running commands.
#[derive(Debug, Default)]
pub struct ScriptedVerifier {
    checks: Mutex<VecDeque<Check>>,
    requests: Mutex<Vec<VerifyRequest>>,
}

impl ScriptedVerifier {
    pub fn new(checks: impl IntoIterator<Item = Check>) -> Self {
        Self {
            checks: Mutex::new(checks.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<VerifyRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl Verifier for ScriptedVerifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyReport> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let check = self
            .checks
            .lock()
            .map_err(|_| anyhow!("checks lock poisoned"))?
            .pop_front()
            .unwrap_or(Check::Pass);
        match check {
            Check::Pass => Ok(VerifyReport {
                verdict: Verdict::Pass,
                results: Vec::new(),
                failure: None,
            }),
            Check::Fail(summary) => Ok(VerifyReport {
                verdict: Verdict::Fail,
                results: Vec::new(),
                failure: Some(FailureBrief::new(
                    request.attempt,
                    Stage::Verify,
                    FailureKind::VerifyFail,
                    summary,
                    "",
                )),
            }),
            Check::Broken(message) => Err(anyhow!(message)),
        }
    }
}
