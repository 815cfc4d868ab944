//! WRITE stage: scope and base-hash checks, then an all-or-nothing apply.
//!
//! Every new content is staged in a sibling temp file before anything is
//! replaced. Targets are then renamed into place one by one; if a rename
//! fails, files already replaced are restored from in-memory backups, new
//! files and any directories created for them are removed.

use std::fs::{self, Permissions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, error, instrument, warn};

use crate::core::hash::content_hash;
use crate::core::scope::{ScopeViolation, check_write_scope};
use crate::core::types::{FailureKind, WorkOrder, WriteProposal};

#[derive(Debug, Error)]
pub enum WriteRejection {
    #[error(transparent)]
    Scope(#[from] ScopeViolation),
    #[error("stale base hash for {path}: proposal expected {}, tree has {}", show(.declared), show(.live))]
    StaleBaseHash {
        path: String,
        declared: Option<String>,
        live: Option<String>,
    },
    #[error("write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl WriteRejection {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Scope(_) => FailureKind::ScopeViolation,
            Self::StaleBaseHash { .. } => FailureKind::StaleBaseHash,
            Self::Io { .. } => FailureKind::WriteIoError,
        }
    }
}

fn show(hash: &Option<String>) -> String {
    match hash {
        Some(hash) => hash.chars().take(12).collect(),
        None => "absent".to_string(),
    }
}

/// Paths written by a successful apply, with what they replaced.
#[derive(Debug, Clone)]
pub struct AppliedWrite {
    pub paths: Vec<String>,
    /// Subset of `paths` that did not exist before.
    pub created: Vec<String>,
    undo: Journal,
}

impl AppliedWrite {
    /// Put every written path back to its pre-apply bytes and mode, delete
    /// files that were new and the directories created for them.
    ///
    /// Covers paths git does not track (ignored files), which a reset to the
    /// baseline leaves alone.
    pub fn revert(self) {
        debug!(paths = self.paths.len(), "reverting applied write");
        self.undo.restore();
    }
}

/// Applies write proposals inside one repository.
#[derive(Debug, Clone)]
pub struct TransactionWriter {
    root: PathBuf,
}

struct Target {
    path: String,
    full: PathBuf,
    content: String,
    original: Option<(Vec<u8>, Permissions)>,
}

struct Staged {
    target: Target,
    temp: NamedTempFile,
}

/// Undo log for the rename phase, kept afterwards for [`AppliedWrite::revert`].
#[derive(Debug, Clone, Default)]
struct Journal {
    created_dirs: Vec<PathBuf>,
    replaced: Vec<(PathBuf, Option<(Vec<u8>, Permissions)>)>,
}

impl Journal {
    fn restore(self) {
        for (full, original) in self.replaced.into_iter().rev() {
            let original_missing = original.is_none();
            let result = match original {
                Some((bytes, perms)) => {
                    fs::write(&full, bytes).and_then(|()| fs::set_permissions(&full, perms))
                }
                None => fs::remove_file(&full),
            };
            match result {
                Err(err) if original_missing && err.kind() == ErrorKind::NotFound => {}
                Err(err) => error!(path = %full.display(), err = %err, "failed to restore file"),
                Ok(()) => {}
            }
        }
        for dir in self.created_dirs.iter().rev() {
            match fs::remove_dir(dir) {
                Err(err) if err.kind() != ErrorKind::NotFound => {
                    warn!(dir = %dir.display(), err = %err, "failed to remove created directory");
                }
                _ => {}
            }
        }
    }
}

impl TransactionWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Check and apply `proposal` for `order`.
    ///
    /// On any rejection the tree is as it was before the call.
    #[instrument(skip_all, fields(work_order = %order.id(), files = proposal.files().len()))]
    pub fn apply(
        &self,
        proposal: &WriteProposal,
        order: &WorkOrder,
    ) -> Result<AppliedWrite, WriteRejection> {
        self.apply_with(proposal, order, |temp, full| {
            temp.persist(full).map(|_| ()).map_err(|err| err.error)
        })
    }

    fn apply_with<F>(
        &self,
        proposal: &WriteProposal,
        order: &WorkOrder,
        mut persist: F,
    ) -> Result<AppliedWrite, WriteRejection>
    where
        F: FnMut(NamedTempFile, &Path) -> io::Result<()>,
    {
        let targets = self.check(proposal, order)?;

        let mut journal = Journal::default();
        let staged = match self.stage(targets, &mut journal) {
            Ok(staged) => staged,
            Err(err) => {
                journal.restore();
                return Err(err);
            }
        };

        let mut paths = Vec::with_capacity(staged.len());
        let mut created = Vec::new();
        let mut pending = staged.into_iter();
        while let Some(Staged { target, temp }) = pending.next() {
            if let Err(source) = persist(temp, &target.full) {
                warn!(path = %target.path, err = %source, "rename failed, restoring");
                // Unpersisted temp files are deleted on drop; do that before
                // removing the directories that hold them.
                drop(pending);
                journal.restore();
                return Err(WriteRejection::Io {
                    path: target.path,
                    source,
                });
            }
            if target.original.is_none() {
                created.push(target.path.clone());
            }
            journal.replaced.push((target.full, target.original));
            paths.push(target.path);
        }

        debug!(written = paths.len(), created = created.len(), "write set applied");
        Ok(AppliedWrite {
            paths,
            created,
            undo: journal,
        })
    }

    /// Scope and precondition checks for every path, before any byte is written.
    fn check(
        &self,
        proposal: &WriteProposal,
        order: &WorkOrder,
    ) -> Result<Vec<Target>, WriteRejection> {
        let mut normalized = Vec::with_capacity(proposal.files().len());
        for (path, content) in proposal.files() {
            let clean = check_write_scope(path, order.allowed_files(), order.forbidden())?;
            normalized.push((path, clean, content));
        }

        let mut targets = Vec::with_capacity(normalized.len());
        for (raw, path, content) in normalized {
            let full = self.root.join(&path);
            let original = read_original(&full).map_err(|source| WriteRejection::Io {
                path: path.clone(),
                source,
            })?;
            let live = original.as_ref().map(|(bytes, _)| content_hash(bytes));
            let declared = proposal.base_hashes().get(raw).or_else(|| proposal.base_hashes().get(&path));
            match declared {
                Some(declared) if *declared == live => {}
                other => {
                    return Err(WriteRejection::StaleBaseHash {
                        path,
                        declared: other.cloned().flatten(),
                        live,
                    });
                }
            }
            targets.push(Target {
                path,
                full,
                content: content.clone(),
                original,
            });
        }
        Ok(targets)
    }

    fn stage(
        &self,
        targets: Vec<Target>,
        journal: &mut Journal,
    ) -> Result<Vec<Staged>, WriteRejection> {
        let mut staged = Vec::with_capacity(targets.len());
        for target in targets {
            let io_err = |source: io::Error| WriteRejection::Io {
                path: target.path.clone(),
                source,
            };
            let parent = target
                .full
                .parent()
                .ok_or_else(|| io_err(io::Error::new(ErrorKind::InvalidInput, "no parent")))?
                .to_path_buf();
            self.create_parents(&parent, journal).map_err(io_err)?;

            let mut temp = NamedTempFile::new_in(&parent).map_err(io_err)?;
            temp.write_all(target.content.as_bytes()).map_err(io_err)?;
            temp.as_file().sync_all().map_err(io_err)?;
            match &target.original {
                Some((_, perms)) => fs::set_permissions(temp.path(), perms.clone()),
                None => set_new_file_mode(temp.path()),
            }
            .map_err(io_err)?;
            staged.push(Staged { target, temp });
        }
        Ok(staged)
    }

    /// Create missing ancestors of `dir` inside the root, recording each one.
    fn create_parents(&self, dir: &Path, journal: &mut Journal) -> io::Result<()> {
        let mut missing = Vec::new();
        let mut current = Some(dir);
        while let Some(path) = current {
            if path == self.root || path.exists() {
                break;
            }
            missing.push(path.to_path_buf());
            current = path.parent();
        }
        for path in missing.into_iter().rev() {
            fs::create_dir(&path)?;
            journal.created_dirs.push(path);
        }
        Ok(())
    }
}

/// Temp files are created owner-only; new files get the usual `0644`.
#[cfg(unix)]
fn set_new_file_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_new_file_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

fn read_original(full: &Path) -> io::Result<Option<(Vec<u8>, Permissions)>> {
    match fs::metadata(full) {
        Ok(meta) if meta.is_dir() => Err(io::Error::new(
            ErrorKind::Other,
            format!("{} is a directory", full.display()),
        )),
        Ok(meta) => Ok(Some((fs::read(full)?, meta.permissions()))),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::core::types::WorkOrderDocument;
    use crate::core::validator::{ValidationRules, validate};

    fn order(allowed: &[&str], forbidden: &[&str]) -> WorkOrder {
        let doc = WorkOrderDocument {
            id: "WO-01".to_string(),
            title: "t".to_string(),
            intent: "i".to_string(),
            allowed_files: allowed.iter().map(|s| s.to_string()).collect(),
            forbidden: forbidden.iter().map(|s| s.to_string()).collect(),
            context_files: Vec::new(),
            acceptance_commands: vec![vec!["sh".to_string(), "scripts/verify.sh".to_string()]],
            notes: None,
        };
        validate(&doc, &ValidationRules::default()).expect("valid order")
    }

    fn proposal(files: &[(&str, &str, Option<&str>)]) -> WriteProposal {
        let mut contents = BTreeMap::new();
        let mut hashes = BTreeMap::new();
        for (path, content, base) in files {
            contents.insert(path.to_string(), content.to_string());
            hashes.insert(path.to_string(), base.map(|b| content_hash(b.as_bytes())));
        }
        WriteProposal {
            files: contents,
            base_hashes: hashes,
            summary: None,
        }
    }

    fn tree(root: &Path) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        collect(root, root, &mut out);
        out
    }

    fn collect(root: &Path, dir: &Path, out: &mut BTreeMap<String, String>) {
        for entry in fs::read_dir(dir).expect("read dir") {
            let path = entry.expect("entry").path();
            let rel = path
                .strip_prefix(root)
                .expect("under root")
                .to_string_lossy()
                .to_string();
            if path.is_dir() {
                out.insert(format!("{rel}/"), String::new());
                collect(root, &path, out);
            } else {
                out.insert(rel, fs::read_to_string(&path).expect("read"));
            }
        }
    }

    #[test]
    fn applies_updates_and_new_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old").expect("write");
        let writer = TransactionWriter::new(temp.path());

        let applied = writer
            .apply(
                &proposal(&[("a.txt", "new", Some("old")), ("src/b.rs", "fn b() {}", None)]),
                &order(&["a.txt", "src/b.rs"], &[]),
            )
            .expect("apply");

        assert_eq!(applied.paths, vec!["a.txt".to_string(), "src/b.rs".to_string()]);
        assert_eq!(applied.created, vec!["src/b.rs".to_string()]);
        assert_eq!(fs::read_to_string(temp.path().join("a.txt")).expect("read"), "new");
        assert_eq!(
            fs::read_to_string(temp.path().join("src/b.rs")).expect("read"),
            "fn b() {}"
        );
    }

    #[test]
    fn scope_violation_touches_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old").expect("write");
        let before = tree(temp.path());
        let writer = TransactionWriter::new(temp.path());

        let err = writer
            .apply(
                &proposal(&[("a.txt", "new", Some("old")), ("b.txt", "x", None)]),
                &order(&["a.txt"], &[]),
            )
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::ScopeViolation);
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn forbidden_glob_is_a_scope_violation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = TransactionWriter::new(temp.path());
        let mut order = order(&["gen/out.txt"], &[]);
        order.forbidden = vec!["gen/*.txt".to_string()];

        let err = writer
            .apply(&proposal(&[("gen/out.txt", "x", None)]), &order)
            .unwrap_err();
        assert!(matches!(err, WriteRejection::Scope(ScopeViolation::Forbidden { .. })));
        assert!(!temp.path().join("gen").exists());
    }

    #[test]
    fn stale_hash_is_rejected_before_any_write() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "H2").expect("write");
        fs::write(temp.path().join("b.txt"), "b").expect("write");
        let before = tree(temp.path());
        let writer = TransactionWriter::new(temp.path());

        let err = writer
            .apply(
                &proposal(&[("a.txt", "new", Some("H1")), ("b.txt", "new", Some("b"))]),
                &order(&["a.txt", "b.txt"], &[]),
            )
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::StaleBaseHash);
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn file_that_appeared_since_snapshot_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "surprise").expect("write");
        let writer = TransactionWriter::new(temp.path());

        let err = writer
            .apply(&proposal(&[("a.txt", "new", None)]), &order(&["a.txt"], &[]))
            .unwrap_err();
        assert!(matches!(
            err,
            WriteRejection::StaleBaseHash { declared: None, live: Some(_), .. }
        ));
    }

    #[test]
    fn stale_classification_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "H2").expect("write");
        let writer = TransactionWriter::new(temp.path());
        let proposal = proposal(&[("a.txt", "new", Some("H1"))]);
        let order = order(&["a.txt"], &[]);

        let first = writer.apply(&proposal, &order).unwrap_err().to_string();
        let second = writer.apply(&proposal, &order).unwrap_err().to_string();
        assert_eq!(first, second);
    }

    #[test]
    fn failed_rename_restores_replaced_files_and_removes_new_ones() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old-a").expect("write");
        fs::write(temp.path().join("z.txt"), "old-z").expect("write");
        let before = tree(temp.path());
        let writer = TransactionWriter::new(temp.path());

        // BTreeMap order: a.txt, new/dir/n.txt, z.txt. Fail on the third rename.
        let mut calls = 0;
        let err = writer
            .apply_with(
                &proposal(&[
                    ("a.txt", "new-a", Some("old-a")),
                    ("new/dir/n.txt", "n", None),
                    ("z.txt", "new-z", Some("old-z")),
                ]),
                &order(&["a.txt", "new/dir/n.txt", "z.txt"], &[]),
                |temp_file, full| {
                    calls += 1;
                    if calls == 3 {
                        return Err(io::Error::new(ErrorKind::Other, "disk full"));
                    }
                    temp_file.persist(full).map(|_| ()).map_err(|err| err.error)
                },
            )
            .unwrap_err();

        assert_eq!(err.kind(), FailureKind::WriteIoError);
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn revert_restores_bytes_and_removes_new_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.txt"), "old").expect("write");
        let before = tree(temp.path());
        let writer = TransactionWriter::new(temp.path());

        let applied = writer
            .apply(
                &proposal(&[("a.txt", "new", Some("old")), ("gen/deep/b.txt", "b", None)]),
                &order(&["a.txt", "gen/deep/b.txt"], &[]),
            )
            .expect("apply");
        assert_ne!(tree(temp.path()), before);

        applied.revert();
        assert_eq!(tree(temp.path()), before);
    }

    #[test]
    fn directory_at_target_is_an_io_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir(temp.path().join("a.txt")).expect("mkdir");
        let writer = TransactionWriter::new(temp.path());

        let err = writer
            .apply(&proposal(&[("a.txt", "x", None)]), &order(&["a.txt"], &[]))
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::WriteIoError);
    }

    #[test]
    fn undeclared_base_hash_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        let writer = TransactionWriter::new(temp.path());
        let mut proposal = proposal(&[("a.txt", "x", None)]);
        proposal.base_hashes.clear();

        let err = writer.apply(&proposal, &order(&["a.txt"], &[])).unwrap_err();
        assert_eq!(err.kind(), FailureKind::StaleBaseHash);
        assert!(!temp.path().join("a.txt").exists());
    }
}
