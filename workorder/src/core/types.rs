//! Shared deterministic types for the execution engine.
//!
//! These types are the stable contract between the validator, the stages, and
//! the run artifacts. They carry no I/O and serialize to stable JSON.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Work-order document as produced by the planner, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkOrderDocument {
    pub id: String,
    pub title: String,
    pub intent: String,
    pub allowed_files: Vec<String>,
    #[serde(default)]
    pub forbidden: Vec<String>,
    #[serde(default)]
    pub context_files: Vec<String>,
    #[serde(default)]
    pub acceptance_commands: Vec<Vec<String>>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// A validated work order.
///
/// Only the validator constructs this type; fields are read through accessors
/// so a validated order cannot be edited afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkOrder {
    pub(crate) id: String,
    pub(crate) title: String,
    pub(crate) intent: String,
    pub(crate) allowed_files: BTreeSet<String>,
    pub(crate) forbidden: Vec<String>,
    pub(crate) context_files: BTreeSet<String>,
    pub(crate) acceptance_commands: Vec<Vec<String>>,
    pub(crate) notes: Option<String>,
}

impl WorkOrder {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn intent(&self) -> &str {
        &self.intent
    }

    /// Maximum write surface (normalized repository-relative paths).
    pub fn allowed_files(&self) -> &BTreeSet<String> {
        &self.allowed_files
    }

    /// Paths, directory prefixes, or glob patterns that are never writable.
    pub fn forbidden(&self) -> &[String] {
        &self.forbidden
    }

    /// Read scope shown to the oracle. Independent of the write scope.
    pub fn context_files(&self) -> &BTreeSet<String> {
        &self.context_files
    }

    pub fn acceptance_commands(&self) -> &[Vec<String>] {
        &self.acceptance_commands
    }

    pub fn notes(&self) -> Option<&str> {
        self.notes.as_deref()
    }
}

/// Candidate write set returned by the oracle for one attempt.
///
/// `base_hashes` maps every target path to the content hash the proposal was
/// generated against; `None` means the file was believed absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteProposal {
    pub(crate) files: BTreeMap<String, String>,
    pub(crate) base_hashes: BTreeMap<String, Option<String>>,
    pub(crate) summary: Option<String>,
}

impl WriteProposal {
    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.files
    }

    pub fn base_hashes(&self) -> &BTreeMap<String, Option<String>> {
        &self.base_hashes
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    pub fn paths(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }
}

/// Outcome of one child-process execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub argv: Vec<String>,
    /// `None` when the process was killed by a signal or never launched.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub elapsed_ms: u64,
    pub timed_out: bool,
    /// Set when the OS refused to start the process.
    pub launch_error: Option<String>,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.launch_error.is_none() && self.exit_code == Some(0)
    }
}

/// Stage of the PROPOSE -> WRITE -> VERIFY loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Stage {
    Propose,
    Write,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Propose => write!(f, "PROPOSE"),
            Self::Write => write!(f, "WRITE"),
            Self::Verify => write!(f, "VERIFY"),
        }
    }
}

/// Error taxonomy shared by failure briefs, summaries, and fatal errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    SchemaError,
    ScopeViolation,
    StaleBaseHash,
    OracleError,
    VerifyFail,
    Timeout,
    LaunchError,
    WriteIoError,
    GitError,
    Cancelled,
}

impl FailureKind {
    /// Recoverable kinds are absorbed by the retry controller.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            Self::ScopeViolation
                | Self::StaleBaseHash
                | Self::OracleError
                | Self::VerifyFail
                | Self::Timeout
                | Self::LaunchError
                | Self::WriteIoError
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SchemaError => "SCHEMA_ERROR",
            Self::ScopeViolation => "SCOPE_VIOLATION",
            Self::StaleBaseHash => "STALE_BASE_HASH",
            Self::OracleError => "ORACLE_ERROR",
            Self::VerifyFail => "VERIFY_FAIL",
            Self::Timeout => "TIMEOUT",
            Self::LaunchError => "LAUNCH_ERROR",
            Self::WriteIoError => "WRITE_IO_ERROR",
            Self::GitError => "GIT_ERROR",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured record of what failed in an attempt.
///
/// Briefs are accumulated across attempts and rendered into the next prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureBrief {
    pub attempt: u32,
    pub stage: Stage,
    pub kind: FailureKind,
    /// One-line description.
    pub summary: String,
    /// Captured detail (command output, offending path), bounded in size.
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

impl FailureBrief {
    pub fn new(
        attempt: u32,
        stage: Stage,
        kind: FailureKind,
        summary: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            attempt,
            stage,
            kind,
            summary: summary.into(),
            detail: detail.into(),
            command: None,
            exit_code: None,
        }
    }
}

/// Verification Gate verdict for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Terminal outcome of one work order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunVerdict {
    Success,
    Failed,
}

/// One PROPOSE -> WRITE -> VERIFY pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    /// 1-indexed sequence number.
    pub number: u32,
    pub verdict: Verdict,
    pub failure: Option<FailureBrief>,
    /// Paths the proposal targeted (empty when PROPOSE failed).
    pub proposed_files: Vec<String>,
    pub commands: Vec<CommandResult>,
    pub started_at: String,
    pub finished_at: String,
}

/// Persisted record of one work order's execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub work_order_id: String,
    pub verdict: RunVerdict,
    pub baseline_commit: String,
    pub result_commit: Option<String>,
    pub branch: String,
    pub attempts: Vec<Attempt>,
    /// Paths committed on success.
    pub write_set: Vec<String>,
    /// Tree hash of the working tree when the run ended; `None` if unknown.
    pub final_tree_hash: Option<String>,
    pub cancelled: bool,
    /// Set when a fatal error aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fatal_error: Option<String>,
}

impl RunSummary {
    /// Failure briefs of every attempt, in order.
    pub fn briefs(&self) -> Vec<&FailureBrief> {
        self.attempts
            .iter()
            .filter_map(|attempt| attempt.failure.as_ref())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_kind_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&FailureKind::StaleBaseHash).expect("serialize");
        assert_eq!(json, "\"STALE_BASE_HASH\"");
        assert_eq!(FailureKind::StaleBaseHash.to_string(), "STALE_BASE_HASH");
    }

    #[test]
    fn fatal_kinds_are_not_recoverable() {
        assert!(!FailureKind::SchemaError.is_recoverable());
        assert!(!FailureKind::GitError.is_recoverable());
        assert!(!FailureKind::Cancelled.is_recoverable());
        assert!(FailureKind::Timeout.is_recoverable());
        assert!(FailureKind::LaunchError.is_recoverable());
    }

    #[test]
    fn command_result_success_requires_zero_exit_without_timeout() {
        let mut result = CommandResult {
            argv: vec!["true".to_string()],
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            stdout_truncated: 0,
            stderr_truncated: 0,
            elapsed_ms: 1,
            timed_out: false,
            launch_error: None,
        };
        assert!(result.succeeded());
        result.timed_out = true;
        assert!(!result.succeeded());
    }

    #[test]
    fn document_rejects_unknown_fields() {
        let raw = r#"{"id":"WO-01","title":"t","intent":"i","allowed_files":["a"],"extra":1}"#;
        assert!(serde_json::from_str::<WorkOrderDocument>(raw).is_err());
    }
}
