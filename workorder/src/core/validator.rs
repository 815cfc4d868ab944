//! Semantic validation of work-order documents.
//!
//! Schema conformance is checked by `io::document` before a document reaches
//! this module; here we enforce the rules a JSON Schema cannot express.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use crate::core::commands::{CommandProblem, check_argv};
use crate::core::paths::{normalize_repo_path, refers_to};
use crate::core::scope::{forbidden_matches, validate_forbidden_entry};
use crate::core::types::{WorkOrder, WorkOrderDocument};

/// Upper bound on `context_files` per work order.
pub const MAX_CONTEXT_FILES: usize = 10;

static ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(.*?)(\d+)$").expect("id regex is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationErrorKind {
    Schema,
    InvalidId,
    DuplicateId,
    NonContiguousId,
    InvalidPath,
    EmptyAllowedFiles,
    ForbiddenAllowed,
    InvalidForbidden,
    ContextLimit,
    EmptyCommand,
    ShellString,
    ShellOperator,
    MissingGlobalVerify,
}

/// One validation failure: which order, which field, what went wrong.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub work_order: Option<String>,
    pub field: String,
    pub kind: ValidationErrorKind,
    pub message: String,
}

impl ValidationError {
    pub fn new(
        work_order: Option<&str>,
        field: impl Into<String>,
        kind: ValidationErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            work_order: work_order.map(str::to_string),
            field: field.into(),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.work_order {
            Some(id) => write!(f, "{id}: {}: {}", self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Settings from the engine configuration that affect validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationRules {
    /// Repository-relative path of the global verification script.
    pub verify_script_path: String,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            verify_script_path: "scripts/verify.sh".to_string(),
        }
    }
}

/// Validate one document and build the immutable [`WorkOrder`].
///
/// All problems are collected rather than stopping at the first.
pub fn validate(
    doc: &WorkOrderDocument,
    rules: &ValidationRules,
) -> Result<WorkOrder, Vec<ValidationError>> {
    let id = doc.id.trim();
    let owner = Some(id);
    let mut errors = Vec::new();

    if id.is_empty() {
        errors.push(ValidationError::new(
            None,
            "id",
            ValidationErrorKind::InvalidId,
            "id must not be empty",
        ));
    }

    let allowed_files = normalize_set(owner, "allowed_files", &doc.allowed_files, &mut errors);
    if doc.allowed_files.is_empty() {
        errors.push(ValidationError::new(
            owner,
            "allowed_files",
            ValidationErrorKind::EmptyAllowedFiles,
            "allowed_files must name at least one file",
        ));
    }

    let mut forbidden = Vec::new();
    for (idx, entry) in doc.forbidden.iter().enumerate() {
        match validate_forbidden_entry(entry) {
            Ok(()) => forbidden.push(entry.trim().to_string()),
            Err(message) => errors.push(ValidationError::new(
                owner,
                format!("forbidden[{idx}]"),
                ValidationErrorKind::InvalidForbidden,
                message,
            )),
        }
    }
    for path in &allowed_files {
        if let Some(entry) = forbidden.iter().find(|entry| forbidden_matches(entry, path)) {
            errors.push(ValidationError::new(
                owner,
                "allowed_files",
                ValidationErrorKind::ForbiddenAllowed,
                format!("{path} is both allowed and forbidden by '{entry}'"),
            ));
        }
    }

    let context_files = normalize_set(owner, "context_files", &doc.context_files, &mut errors);
    if context_files.len() > MAX_CONTEXT_FILES {
        errors.push(ValidationError::new(
            owner,
            "context_files",
            ValidationErrorKind::ContextLimit,
            format!(
                "{} context files exceeds the maximum of {MAX_CONTEXT_FILES}",
                context_files.len()
            ),
        ));
    }

    for (idx, argv) in doc.acceptance_commands.iter().enumerate() {
        if let Err(problem) = check_argv(argv) {
            let field = format!("acceptance_commands[{idx}]");
            let (kind, message) = match problem {
                CommandProblem::Empty => (
                    ValidationErrorKind::EmptyCommand,
                    "command has no program".to_string(),
                ),
                CommandProblem::ShellString(raw) => (
                    ValidationErrorKind::ShellString,
                    format!("'{raw}' is a shell string; split it into an argument vector"),
                ),
                CommandProblem::ShellOperator { index, token } => (
                    ValidationErrorKind::ShellOperator,
                    format!("argument {index} contains shell operator '{token}'"),
                ),
            };
            errors.push(ValidationError::new(owner, field, kind, message));
        }
    }

    let script = rules.verify_script_path.as_str();
    let is_bootstrap = allowed_files.contains(script);
    let invokes_verify = doc
        .acceptance_commands
        .iter()
        .any(|argv| argv.iter().any(|arg| refers_to(arg, script)));
    if !is_bootstrap && !invokes_verify {
        errors.push(ValidationError::new(
            owner,
            "acceptance_commands",
            ValidationErrorKind::MissingGlobalVerify,
            format!("no acceptance command invokes {script}"),
        ));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(WorkOrder {
        id: id.to_string(),
        title: doc.title.trim().to_string(),
        intent: doc.intent.trim().to_string(),
        allowed_files,
        forbidden,
        context_files,
        acceptance_commands: doc.acceptance_commands.clone(),
        notes: doc
            .notes
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

/// Validate a batch: every document on its own, then identifier contiguity.
///
/// Identifiers must share a prefix and carry numeric suffixes forming a
/// gapless ascending run in document order (`WO-01`, `WO-02`, ...).
pub fn validate_batch(
    docs: &[WorkOrderDocument],
    rules: &ValidationRules,
) -> Result<Vec<WorkOrder>, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let mut orders = Vec::with_capacity(docs.len());
    for doc in docs {
        match validate(doc, rules) {
            Ok(order) => orders.push(order),
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    errors.extend(check_id_sequence(docs));

    if errors.is_empty() {
        Ok(orders)
    } else {
        Err(errors)
    }
}

fn check_id_sequence(docs: &[WorkOrderDocument]) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut seen = BTreeSet::new();
    let mut previous: Option<(String, u64, &str)> = None;

    for doc in docs {
        let id = doc.id.trim();
        if !seen.insert(id) {
            errors.push(ValidationError::new(
                Some(id),
                "id",
                ValidationErrorKind::DuplicateId,
                format!("duplicate id {id}"),
            ));
            continue;
        }
        let Some(caps) = ID_RE.captures(id) else {
            errors.push(ValidationError::new(
                Some(id),
                "id",
                ValidationErrorKind::InvalidId,
                format!("id {id} has no numeric suffix"),
            ));
            continue;
        };
        let prefix = caps.get(1).map_or("", |m| m.as_str()).to_string();
        let Ok(number) = caps.get(2).map_or("", |m| m.as_str()).parse::<u64>() else {
            errors.push(ValidationError::new(
                Some(id),
                "id",
                ValidationErrorKind::InvalidId,
                format!("id {id} has an out-of-range numeric suffix"),
            ));
            continue;
        };

        if let Some((prev_prefix, prev_number, prev_id)) = &previous {
            if *prev_prefix != prefix {
                errors.push(ValidationError::new(
                    Some(id),
                    "id",
                    ValidationErrorKind::NonContiguousId,
                    format!("id {id} does not share the prefix of {prev_id}"),
                ));
            } else if number != prev_number + 1 {
                errors.push(ValidationError::new(
                    Some(id),
                    "id",
                    ValidationErrorKind::NonContiguousId,
                    format!("id {id} does not follow {prev_id}"),
                ));
            }
        }
        previous = Some((prefix, number, id));
    }
    errors
}

fn normalize_set(
    owner: Option<&str>,
    field: &str,
    raw: &[String],
    errors: &mut Vec<ValidationError>,
) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for (idx, path) in raw.iter().enumerate() {
        match normalize_repo_path(path) {
            Ok(normalized) => {
                out.insert(normalized);
            }
            Err(message) => errors.push(ValidationError::new(
                owner,
                format!("{field}[{idx}]"),
                ValidationErrorKind::InvalidPath,
                message,
            )),
        }
    }
    out
}
