//! Run artifacts under `<artifacts_dir>/<work_order_id>/<timestamp>_<short-id>/`.
//!
//! - **Summary (`summary.json`)**: written exactly once, never overwritten.
//! - **Attempt files (`attempt-<n>/`)**: prompt, raw oracle output, parsed
//!   proposal, and verification log. Best effort; a failed write is logged
//!   and the run continues.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use rand::{Rng, distributions::Alphanumeric};
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::core::types::RunSummary;

/// Root of all run artifacts for one repository.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

/// Directory of one work-order run.
#[derive(Debug, Clone)]
pub struct RunArtifacts {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a fresh run directory for `work_order_id`.
    #[instrument(skip_all, fields(work_order = work_order_id))]
    pub fn create_run(&self, work_order_id: &str) -> Result<RunArtifacts> {
        let parent = self.root.join(sanitize(work_order_id));
        fs::create_dir_all(&parent)
            .with_context(|| format!("create artifacts dir {}", parent.display()))?;
        let name = format!("{}_{}", generate_timestamp(), generate_short_id());
        let dir = parent.join(name);
        fs::create_dir(&dir).with_context(|| format!("create run dir {}", dir.display()))?;
        debug!(dir = %dir.display(), "run artifacts dir created");
        Ok(RunArtifacts { dir })
    }
}

impl RunArtifacts {
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn summary_path(&self) -> PathBuf {
        self.dir.join("summary.json")
    }

    pub fn attempt_dir(&self, attempt: u32) -> PathBuf {
        self.dir.join(format!("attempt-{attempt}"))
    }

    /// Write one per-attempt file; failures are logged, not returned.
    pub fn write_attempt_file(&self, attempt: u32, name: &str, contents: &str) {
        let dir = self.attempt_dir(attempt);
        let path = dir.join(name);
        let result = fs::create_dir_all(&dir).and_then(|()| fs::write(&path, contents));
        if let Err(err) = result {
            warn!(path = %path.display(), err = %err, "failed to write attempt artifact");
        }
    }

    /// Same as [`write_attempt_file`](Self::write_attempt_file), as pretty JSON.
    pub fn write_attempt_json<T: Serialize>(&self, attempt: u32, name: &str, value: &T) {
        match serde_json::to_string_pretty(value) {
            Ok(mut buf) => {
                buf.push('\n');
                self.write_attempt_file(attempt, name, &buf);
            }
            Err(err) => warn!(name, err = %err, "failed to serialize attempt artifact"),
        }
    }

    /// Persist the run summary. Fails if a summary already exists.
    pub fn write_summary(&self, summary: &RunSummary) -> Result<PathBuf> {
        let path = self.summary_path();
        let mut buf = serde_json::to_string_pretty(summary).context("serialize run summary")?;
        buf.push('\n');
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create {}", path.display()))?;
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        file.sync_all()
            .with_context(|| format!("sync {}", path.display()))?;
        debug!(path = %path.display(), "run summary written");
        Ok(path)
    }
}

/// Load a persisted summary.
pub fn read_summary(path: &Path) -> Result<RunSummary> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn generate_timestamp() -> String {
    Utc::now().format("%Y%m%d_%H%M%S").to_string()
}

fn generate_short_id() -> String {
    let mut rng = rand::thread_rng();
    std::iter::repeat_with(|| rng.sample(Alphanumeric))
        .map(char::from)
        .take(6)
        .collect::<String>()
        .to_lowercase()
}
