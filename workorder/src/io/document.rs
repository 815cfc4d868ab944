//! Loading work-order documents: JSON Schema first, then typed deserialization.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jsonschema::Draft;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::types::WorkOrderDocument;
use crate::core::validator::{ValidationError, ValidationErrorKind};
use crate::errors::EngineError;

pub(crate) const WORK_ORDER_SCHEMA: &str = include_str!("../../schemas/work_order.schema.json");

/// Validate a JSON instance against an embedded JSON Schema (Draft 2020-12).
///
/// Returns one message per violation; an empty list means the instance conforms.
pub(crate) fn schema_errors(schema_raw: &str, instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(schema_raw).context("parse embedded schema")?;
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(&schema)
        .context("compile json schema")?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

/// Parse one document. `source` names it in error messages.
pub fn parse_document(
    source: &str,
    raw: &str,
) -> Result<Result<WorkOrderDocument, Vec<ValidationError>>> {
    let schema_error = |message: String| {
        ValidationError::new(None, source, ValidationErrorKind::Schema, message)
    };

    let instance: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return Ok(Err(vec![schema_error(format!("invalid JSON: {err}"))])),
    };
    let messages = schema_errors(WORK_ORDER_SCHEMA, &instance)?;
    if !messages.is_empty() {
        return Ok(Err(messages.into_iter().map(schema_error).collect()));
    }
    match serde_json::from_value::<WorkOrderDocument>(instance) {
        Ok(doc) => Ok(Ok(doc)),
        Err(err) => Ok(Err(vec![schema_error(err.to_string())])),
    }
}

/// Read and parse every document, in the given order.
///
/// Schema problems from all files are collected before failing.
#[instrument(skip_all, fields(count = paths.len()))]
pub fn load_documents(paths: &[PathBuf]) -> Result<Vec<WorkOrderDocument>, EngineError> {
    let mut docs = Vec::with_capacity(paths.len());
    let mut errors = Vec::new();
    for path in paths {
        let raw = read_document(path).map_err(EngineError::Input)?;
        let source = path.display().to_string();
        match parse_document(&source, &raw).map_err(EngineError::Input)? {
            Ok(doc) => docs.push(doc),
            Err(mut errs) => errors.append(&mut errs),
        }
    }
    if !errors.is_empty() {
        return Err(EngineError::Schema(errors));
    }
    debug!(loaded = docs.len(), "work order documents loaded");
    Ok(docs)
}

fn read_document(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("read {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"{
        "id": "WO-01",
        "title": "Add greeting",
        "intent": "Print a greeting",
        "allowed_files": ["src/main.rs"],
        "acceptance_commands": [["sh", "scripts/verify.sh"]]
    }"#;

    #[test]
    fn parses_valid_document_with_defaults() {
        let doc = parse_document("wo.json", VALID).expect("schema").expect("valid");
        assert_eq!(doc.id, "WO-01");
        assert!(doc.forbidden.is_empty());
        assert!(doc.context_files.is_empty());
        assert_eq!(doc.notes, None);
    }

    #[test]
    fn missing_required_field_is_a_schema_error() {
        let raw = r#"{"id": "WO-01", "title": "t", "allowed_files": ["a"]}"#;
        let errors = parse_document("wo.json", raw).expect("schema").unwrap_err();
        assert!(!errors.is_empty());
        assert!(errors.iter().all(|e| e.kind == ValidationErrorKind::Schema));
        assert!(errors.iter().any(|e| e.message.contains("intent")));
    }

    #[test]
    fn shell_string_command_fails_schema() {
        let raw = r#"{
            "id": "WO-01", "title": "t", "intent": "i",
            "allowed_files": ["a"],
            "acceptance_commands": ["cargo test"]
        }"#;
        let errors = parse_document("wo.json", raw).expect("schema").unwrap_err();
        assert_eq!(errors[0].field, "wo.json");
    }

    #[test]
    fn invalid_json_is_reported_not_raised() {
        let errors = parse_document("wo.json", "{not json").expect("schema").unwrap_err();
        assert!(errors[0].message.starts_with("invalid JSON"));
    }

    #[test]
    fn load_documents_collects_errors_across_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let good = temp.path().join("wo-01.json");
        let bad = temp.path().join("wo-02.json");
        fs::write(&good, VALID).expect("write");
        fs::write(&bad, r#"{"id": "WO-02"}"#).expect("write");

        let err = load_documents(&[good.clone(), bad]).unwrap_err();
        assert!(matches!(err, EngineError::Schema(_)));

        let docs = load_documents(&[good]).expect("load");
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn missing_file_is_an_input_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = load_documents(&[temp.path().join("nope.json")]).unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }
}
