//! Read-only snapshot of the files shown to the oracle.
//!
//! The snapshot also fixes the base hash of every writable path; the
//! transaction writer re-checks those hashes against the live tree.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::core::hash::content_hash;
use crate::core::types::WorkOrder;

/// One context file as the oracle will see it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextFile {
    pub path: String,
    /// `None` when the file is absent or not UTF-8.
    pub content: Option<String>,
    /// `None` when the file is absent.
    pub hash: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContextSnapshot {
    pub files: Vec<ContextFile>,
    /// Hash of every context and writable path at capture time (`None` = absent).
    pub base_hashes: BTreeMap<String, Option<String>>,
}

impl ContextSnapshot {
    /// Base hash recorded for `path`, or `None` if the path was not captured.
    pub fn base_hash(&self, path: &str) -> Option<&Option<String>> {
        self.base_hashes.get(path)
    }
}

/// Capture context contents and base hashes for a work order.
#[instrument(skip_all, fields(work_order = %order.id()))]
pub fn capture(root: &Path, order: &WorkOrder) -> Result<ContextSnapshot> {
    let mut snapshot = ContextSnapshot::default();

    for path in order.context_files() {
        let bytes = read_optional(root, path)?;
        let hash = bytes.as_deref().map(content_hash);
        let content = bytes.and_then(|b| String::from_utf8(b).ok());
        snapshot.base_hashes.insert(path.clone(), hash.clone());
        snapshot.files.push(ContextFile {
            path: path.clone(),
            content,
            hash,
        });
    }

    for path in order.allowed_files() {
        if snapshot.base_hashes.contains_key(path) {
            continue;
        }
        let hash = live_hash(root, path)?;
        snapshot.base_hashes.insert(path.clone(), hash);
    }

    debug!(
        context_files = snapshot.files.len(),
        hashed = snapshot.base_hashes.len(),
        "context captured"
    );
    Ok(snapshot)
}

/// Current content hash of a repository path, or `None` if it does not exist.
pub fn live_hash(root: &Path, path: &str) -> Result<Option<String>> {
    Ok(read_optional(root, path)?.as_deref().map(content_hash))
}

fn read_optional(root: &Path, path: &str) -> Result<Option<Vec<u8>>> {
    let full = root.join(path);
    match fs::read(&full) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", full.display())),
    }
}
