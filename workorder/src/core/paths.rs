//! Normalization of repository-relative paths.

use std::path::{Component, Path};

/// Normalize a repository-relative path to its canonical `a/b/c` form.
///
/// Rejects absolute paths, parent traversal, empty paths, and anything inside
/// `.git/`. `./` components are dropped.
pub fn normalize_repo_path(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("path is empty".to_string());
    }
    if trimmed.contains('\\') {
        return Err(format!("'{raw}' uses '\\' separators"));
    }
    if trimmed.ends_with('/') {
        return Err(format!("'{raw}' names a directory, not a file"));
    }

    let mut parts = Vec::new();
    for component in Path::new(trimmed).components() {
        match component {
            Component::Normal(name) => {
                let name = name
                    .to_str()
                    .ok_or_else(|| format!("'{raw}' is not valid UTF-8"))?;
                parts.push(name);
            }
            Component::CurDir => {}
            Component::ParentDir => return Err(format!("'{raw}' escapes the repository")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("'{raw}' must be repository-relative"));
            }
        }
    }

    match parts.first() {
        None => Err(format!("'{raw}' does not name a file")),
        Some(&".git") => Err(format!("'{raw}' is inside .git")),
        Some(_) => Ok(parts.join("/")),
    }
}

/// True if `arg` refers to the repository-relative `script_path`.
pub fn refers_to(arg: &str, script_path: &str) -> bool {
    match normalize_repo_path(arg) {
        Ok(normalized) => normalized == script_path,
        Err(_) => false,
    }
}
