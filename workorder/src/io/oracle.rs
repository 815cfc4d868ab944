//! Proposal oracle abstraction and response parsing.
//!
//! The [`Oracle`] trait decouples the engine from the backend that produces
//! proposals (by default an external command fed the prompt on stdin). Tests
//! use scripted oracles that return canned responses without spawning
//! processes.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Result, anyhow};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::paths::normalize_repo_path;
use crate::core::types::WriteProposal;
use crate::io::context::ContextSnapshot;
use crate::io::document::schema_errors;
use crate::io::process::run_command_with_timeout;

const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");

static FENCED_JSON_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json|JSON)[ \t]*\r?\n(.*?)\r?\n[ \t]*```").expect("fence regex is valid")
});

/// Parameters for one oracle call.
#[derive(Debug, Clone)]
pub struct OracleRequest {
    pub work_order_id: String,
    pub attempt: u32,
    pub prompt: String,
    /// Working directory for the oracle process.
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Abstraction over proposal backends.
pub trait Oracle {
    /// Return the raw response text for `request.prompt`.
    ///
    /// Implementations that wait should give up with [`Cancelled`] once
    /// `cancel` fires.
    fn propose(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String>;
}

/// Oracle that spawns a configured command and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CommandOracle {
    command: Vec<String>,
}

impl CommandOracle {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

impl Oracle for CommandOracle {
    #[instrument(skip_all, fields(work_order = %request.work_order_id, attempt = request.attempt))]
    fn propose(&self, request: &OracleRequest, cancel: &CancelToken) -> Result<String> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("oracle command is empty"))?;
        info!(program = %program, "invoking oracle");

        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&request.workdir);
        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            request.output_limit_bytes,
            Some(cancel),
        )?;

        if output.cancelled {
            return Err(Cancelled.into());
        }
        if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "oracle timed out");
            return Err(anyhow!("oracle timed out after {:?}", request.timeout));
        }
        if !output.status.success() {
            warn!(exit_code = ?output.status.code(), "oracle failed");
            return Err(anyhow!(
                "oracle exited with status {:?}: {}",
                output.status.code(),
                output.stderr_lossy().trim()
            ));
        }
        debug!(bytes = output.stdout.len(), "oracle responded");
        Ok(output.stdout_lossy())
    }
}

/// Result of parsing an oracle response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Parsed(WriteProposal),
    ParseError(String),
}

#[derive(Debug, Deserialize)]
struct RawProposal {
    #[serde(default)]
    summary: Option<String>,
    files: Vec<RawFile>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    path: String,
    content: String,
    /// Outer `None`: field omitted. `Some(None)`: explicit `null` (file believed absent).
    #[serde(default, deserialize_with = "deserialize_some")]
    base_hash: Option<Option<String>>,
}

fn deserialize_some<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Parse a raw oracle response into a [`WriteProposal`].
///
/// Base hashes the oracle omitted are filled from `snapshot`, so the write
/// precondition always refers to what the oracle was shown. Paths are
/// normalized when possible; invalid paths are kept verbatim for the scope
/// check to reject.
pub fn parse_proposal(text: &str, snapshot: &ContextSnapshot) -> ParseOutcome {
    let Some(value) = extract_json(text) else {
        return ParseOutcome::ParseError("response contains no JSON object".to_string());
    };

    let messages = match schema_errors(PROPOSAL_SCHEMA, &value) {
        Ok(messages) => messages,
        Err(err) => return ParseOutcome::ParseError(format!("{err:#}")),
    };
    if !messages.is_empty() {
        return ParseOutcome::ParseError(format!(
            "proposal does not match schema: {}",
            messages.join("; ")
        ));
    }

    let raw: RawProposal = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(err) => return ParseOutcome::ParseError(format!("decode proposal: {err}")),
    };

    let mut files = BTreeMap::new();
    let mut base_hashes = BTreeMap::new();
    for file in raw.files {
        let path = normalize_repo_path(&file.path).unwrap_or(file.path);
        if files.contains_key(&path) {
            return ParseOutcome::ParseError(format!("path {path} appears more than once"));
        }
        let base = match file.base_hash {
            Some(declared) => declared,
            None => snapshot.base_hash(&path).cloned().flatten(),
        };
        base_hashes.insert(path.clone(), base);
        files.insert(path, file.content);
    }

    ParseOutcome::Parsed(WriteProposal {
        files,
        base_hashes,
        summary: raw
            .summary
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty()),
    })
}

/// Find the proposal object: a fenced json block, the whole text, or the
/// outermost braces, in that order.
fn extract_json(text: &str) -> Option<Value> {
    let fenced = FENCED_JSON_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str()));
    let whole = std::iter::once(text.trim());
    let braces = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&text[start..=end]),
        _ => None,
    };

    fenced
        .chain(whole)
        .chain(braces)
        .filter_map(|candidate| serde_json::from_str::<Value>(candidate).ok())
        .find(Value::is_object)
}
