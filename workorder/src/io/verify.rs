//! VERIFY stage: global verification command, then acceptance commands.
//!
//! Commands are run as argument vectors (no shell), one child process each,
//! in order, stopping at the first failure.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::core::types::{CommandResult, FailureBrief, FailureKind, Stage, Verdict};
use crate::io::process::{SpawnError, run_command_with_timeout};

#[derive(Debug, Clone)]
pub struct VerifyRequest {
    pub workdir: PathBuf,
    pub attempt: u32,
    /// Global command first, then acceptance commands, in declared order.
    pub commands: Vec<Vec<String>>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Output tail kept in a failure brief.
    pub brief_output_limit_bytes: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub verdict: Verdict,
    /// One result per command that ran (or failed to launch).
    pub results: Vec<CommandResult>,
    pub failure: Option<FailureBrief>,
}

impl VerifyReport {
    /// Plain-text log of every command, for run artifacts.
    pub fn render_log(&self) -> String {
        let mut buf = String::new();
        for result in &self.results {
            buf.push_str(&format!("$ {}\n", result.argv.join(" ")));
            if let Some(err) = &result.launch_error {
                buf.push_str(&format!("[launch error: {err}]\n\n"));
                continue;
            }
            buf.push_str("=== stdout ===\n");
            buf.push_str(&result.stdout);
            buf.push_str("\n=== stderr ===\n");
            buf.push_str(&result.stderr);
            buf.push_str(&format!(
                "\n[exit {:?}, {} ms{}]\n\n",
                result.exit_code,
                result.elapsed_ms,
                if result.timed_out { ", timed out" } else { "" }
            ));
        }
        buf
    }
}

/// Abstraction over verification backends.
pub trait Verifier {
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyReport>;
}

/// Verifier that runs each command as a child process.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessVerifier;

impl Verifier for ProcessVerifier {
    #[instrument(skip_all, fields(attempt = request.attempt, commands = request.commands.len()))]
    fn verify(&self, request: &VerifyRequest) -> Result<VerifyReport> {
        let mut results = Vec::with_capacity(request.commands.len());
        for argv in &request.commands {
            let result = run_one(request, argv)?;
            let failure = classify(request, &result);
            results.push(result);
            if let Some(brief) = failure {
                warn!(kind = %brief.kind, summary = %brief.summary, "verification failed");
                return Ok(VerifyReport {
                    verdict: Verdict::Fail,
                    results,
                    failure: Some(brief),
                });
            }
        }
        info!("verification passed");
        Ok(VerifyReport {
            verdict: Verdict::Pass,
            results,
            failure: None,
        })
    }
}

fn run_one(request: &VerifyRequest, argv: &[String]) -> Result<CommandResult> {
    let mut result = CommandResult {
        argv: argv.to_vec(),
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        stdout_truncated: 0,
        stderr_truncated: 0,
        elapsed_ms: 0,
        timed_out: false,
        launch_error: None,
    };
    let Some((program, args)) = argv.split_first() else {
        result.launch_error = Some("empty command".to_string());
        return Ok(result);
    };

    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(&request.workdir);
    match run_command_with_timeout(
        cmd,
        None,
        request.timeout,
        request.output_limit_bytes,
        None,
    ) {
        Ok(output) => {
            result.exit_code = output.status.code();
            result.stdout = output.stdout_lossy();
            result.stderr = output.stderr_lossy();
            result.stdout_truncated = output.stdout_truncated;
            result.stderr_truncated = output.stderr_truncated;
            result.elapsed_ms = u64::try_from(output.elapsed.as_millis()).unwrap_or(u64::MAX);
            result.timed_out = output.timed_out;
            Ok(result)
        }
        Err(err) => match err.downcast_ref::<SpawnError>() {
            Some(spawn) => {
                result.launch_error = Some(spawn.to_string());
                Ok(result)
            }
            None => Err(err),
        },
    }
}

fn classify(request: &VerifyRequest, result: &CommandResult) -> Option<FailureBrief> {
    if result.succeeded() {
        return None;
    }
    let shown = result.argv.join(" ");
    let (kind, summary) = if let Some(err) = &result.launch_error {
        (FailureKind::LaunchError, format!("`{shown}` could not be launched: {err}"))
    } else if result.timed_out {
        (
            FailureKind::Timeout,
            format!(
                "`{shown}` timed out after {}s and was killed",
                request.timeout.as_secs()
            ),
        )
    } else {
        let status = result
            .exit_code
            .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"));
        (FailureKind::VerifyFail, format!("`{shown}` exited with {status}"))
    };

    let mut combined = String::new();
    if !result.stdout.trim().is_empty() {
        combined.push_str(result.stdout.trim_end());
        combined.push('\n');
    }
    if !result.stderr.trim().is_empty() {
        combined.push_str(result.stderr.trim_end());
        combined.push('\n');
    }

    let mut brief = FailureBrief::new(
        request.attempt,
        Stage::Verify,
        kind,
        summary,
        tail(&combined, request.brief_output_limit_bytes),
    );
    brief.command = Some(result.argv.clone());
    brief.exit_code = result.exit_code;
    Some(brief)
}

/// Last `limit` bytes of `text`, cut on a char boundary.
pub fn tail(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("[... {start} bytes omitted]\n{}", &text[start..])
}
