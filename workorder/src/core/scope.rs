//! Write-scope checks for proposal targets.

use std::collections::BTreeSet;

use glob::{MatchOptions, Pattern};
use thiserror::Error;

use crate::core::paths::normalize_repo_path;

/// Why a target path may not be written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScopeViolation {
    #[error("invalid path {path}: {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("{path} is not in allowed_files")]
    NotAllowed { path: String },
    #[error("{path} matches forbidden entry '{entry}'")]
    Forbidden { path: String, entry: String },
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Check that `path` lies inside the write scope.
///
/// `allowed` holds normalized paths. A `forbidden` entry matches as an exact
/// path, as a directory prefix, or as a glob pattern.
pub fn check_write_scope(
    path: &str,
    allowed: &BTreeSet<String>,
    forbidden: &[String],
) -> Result<String, ScopeViolation> {
    let normalized = normalize_repo_path(path).map_err(|reason| ScopeViolation::InvalidPath {
        path: path.to_string(),
        reason,
    })?;

    if let Some(entry) = forbidden
        .iter()
        .find(|entry| forbidden_matches(entry, &normalized))
    {
        return Err(ScopeViolation::Forbidden {
            path: normalized,
            entry: entry.clone(),
        });
    }

    if !allowed.contains(&normalized) {
        return Err(ScopeViolation::NotAllowed { path: normalized });
    }
    Ok(normalized)
}

/// True if a forbidden entry covers `path` (already normalized).
pub fn forbidden_matches(entry: &str, path: &str) -> bool {
    let entry = entry.trim().trim_start_matches("./");
    if entry.is_empty() {
        return false;
    }
    let prefix = entry.trim_end_matches('/');
    if path == prefix || path.starts_with(&format!("{prefix}/")) {
        return true;
    }
    match Pattern::new(entry) {
        Ok(pattern) => pattern.matches_with(path, MATCH_OPTIONS),
        Err(_) => false,
    }
}

/// Check that a forbidden entry is a usable pattern.
pub fn validate_forbidden_entry(entry: &str) -> Result<(), String> {
    if entry.trim().is_empty() {
        return Err("forbidden entry is empty".to_string());
    }
    Pattern::new(entry.trim())
        .map(|_| ())
        .map_err(|err| format!("invalid pattern '{entry}': {err}"))
}
