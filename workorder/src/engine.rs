//! Execution of one work order: PROPOSE -> WRITE -> VERIFY with bounded retry.
//!
//! The engine owns the attempt list and the current proposal. Every stage
//! failure is turned into a [`FailureBrief`] and rolled back to the baseline;
//! only git, artifact, and state-machine failures abort the run.

use std::path::{Path, PathBuf};

use anyhow::anyhow;
use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::cancel::{CancelToken, Cancelled};
use crate::core::machine::{Effect, Event, ExecutionMachine, State};
use crate::core::retry::{RetryController, RetryDecision};
use crate::core::types::{
    Attempt, CommandResult, FailureBrief, FailureKind, RunSummary, RunVerdict, Stage, Verdict,
    WorkOrder, WriteProposal,
};
use crate::errors::EngineError;
use crate::io::artifacts::{ArtifactStore, RunArtifacts};
use crate::io::baseline::{Baseline, BaselineManager};
use crate::io::config::EngineConfig;
use crate::io::context;
use crate::io::oracle::{Oracle, OracleRequest, ParseOutcome, parse_proposal};
use crate::io::prompt::{PromptInputs, render_proposal_prompt};
use crate::io::verify::{Verifier, VerifyRequest, tail};
use crate::io::writer::{AppliedWrite, TransactionWriter};

/// Drives work orders against one repository.
pub struct Engine<'a, O: Oracle + ?Sized, V: Verifier + ?Sized> {
    root: PathBuf,
    config: &'a EngineConfig,
    oracle: &'a O,
    verifier: &'a V,
    cancel: CancelToken,
    baseline: BaselineManager,
    writer: TransactionWriter,
    artifacts: ArtifactStore,
}

/// Attempt being built while its stages run.
struct AttemptDraft {
    number: u32,
    started_at: String,
    proposed_files: Vec<String>,
    commands: Vec<CommandResult>,
}

impl AttemptDraft {
    fn start(number: u32) -> Self {
        Self {
            number,
            started_at: now(),
            proposed_files: Vec::new(),
            commands: Vec::new(),
        }
    }

    fn finish(self, verdict: Verdict, failure: Option<FailureBrief>) -> Attempt {
        Attempt {
            number: self.number,
            verdict,
            failure,
            proposed_files: self.proposed_files,
            commands: self.commands,
            started_at: self.started_at,
            finished_at: now(),
        }
    }
}

/// What the run accumulated, whether it ends normally or fatally.
#[derive(Default)]
struct RunRecord {
    attempts: Vec<Attempt>,
    result_commit: Option<String>,
    write_set: Vec<String>,
    cancelled: bool,
}

enum ProposeOutcome {
    Proposal(WriteProposal),
    Failed(FailureBrief),
    Cancelled,
}

impl<'a, O: Oracle + ?Sized, V: Verifier + ?Sized> Engine<'a, O, V> {
    pub fn new(
        root: impl Into<PathBuf>,
        config: &'a EngineConfig,
        oracle: &'a O,
        verifier: &'a V,
    ) -> Self {
        let root = root.into();
        Self {
            baseline: BaselineManager::new(&root),
            writer: TransactionWriter::new(&root),
            artifacts: ArtifactStore::new(root.join(&config.artifacts_dir)),
            root,
            config,
            oracle,
            verifier,
            cancel: CancelToken::new(),
        }
    }

    /// Share a cancellation token with the caller.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Execute one validated work order to a terminal state.
    ///
    /// Returns the persisted summary for SUCCESS and FAILED alike. `Err` means
    /// a fatal error; a best-effort summary is still written when the run
    /// directory exists.
    #[instrument(skip_all, fields(work_order = %order.id()))]
    pub fn run_work_order(&self, order: &WorkOrder) -> Result<RunSummary, EngineError> {
        self.baseline
            .git()
            .ensure_excluded(&format!("/{}/", self.config.artifacts_root()))
            .map_err(|err| EngineError::Git(err.context("exclude run artifacts from git")))?;
        let baseline = self.baseline.snapshot().map_err(EngineError::Git)?;
        let run = self
            .artifacts
            .create_run(order.id())
            .map_err(EngineError::Artifact)?;
        info!(baseline = %baseline.commit, branch = %baseline.branch, "work order started");

        let mut record = RunRecord::default();
        let outcome = self.drive(order, &baseline, &run, &mut record);
        let final_tree_hash = match self.baseline.tree_hash() {
            Ok(hash) => Some(hash),
            Err(err) => {
                warn!(err = %err, "could not compute final tree hash");
                None
            }
        };

        let verdict = match (&outcome, &record.result_commit) {
            (Ok(()), Some(_)) => RunVerdict::Success,
            _ => RunVerdict::Failed,
        };
        let summary = RunSummary {
            work_order_id: order.id().to_string(),
            verdict,
            baseline_commit: baseline.commit.clone(),
            result_commit: record.result_commit,
            branch: baseline.branch.clone(),
            attempts: record.attempts,
            write_set: record.write_set,
            final_tree_hash,
            cancelled: record.cancelled,
            fatal_error: outcome.as_ref().err().map(ToString::to_string),
        };

        match outcome {
            Ok(()) => {
                let path = run.write_summary(&summary).map_err(EngineError::Artifact)?;
                info!(
                    verdict = ?summary.verdict,
                    attempts = summary.attempts.len(),
                    summary = %path.display(),
                    "work order finished"
                );
                Ok(summary)
            }
            Err(err) => {
                error!(err = %err, "work order aborted");
                if let Err(write_err) = run.write_summary(&summary) {
                    warn!(err = %write_err, "failed to persist summary of aborted run");
                }
                Err(err)
            }
        }
    }

    fn drive(
        &self,
        order: &WorkOrder,
        baseline: &Baseline,
        run: &RunArtifacts,
        record: &mut RunRecord,
    ) -> Result<(), EngineError> {
        let mut machine = ExecutionMachine::new();
        let mut retry = RetryController::new(self.config.max_attempts);
        let mut draft: Option<AttemptDraft> = None;
        let mut proposal: Option<WriteProposal> = None;
        let mut applied: Option<AppliedWrite> = None;

        while !machine.current().is_terminal() {
            let event = match machine.current() {
                State::Propose => {
                    if self.cancel.is_cancelled() {
                        info!("cancelled before attempt");
                        record.cancelled = true;
                        Event::Cancelled
                    } else {
                        let number = retry.begin_attempt();
                        let mut current = AttemptDraft::start(number);
                        let outcome = self.propose(order, number, &retry, run);
                        match outcome {
                            ProposeOutcome::Proposal(p) if !self.cancel.is_cancelled() => {
                                current.proposed_files = p.paths();
                                proposal = Some(p);
                                draft = Some(current);
                                Event::StageOk
                            }
                            ProposeOutcome::Proposal(_) | ProposeOutcome::Cancelled => {
                                info!(attempt = number, "cancelled during proposal");
                                let brief = FailureBrief::new(
                                    number,
                                    Stage::Propose,
                                    FailureKind::Cancelled,
                                    "run cancelled",
                                    "",
                                );
                                retry.record_failure(brief.clone());
                                record.attempts.push(current.finish(Verdict::Fail, Some(brief)));
                                record.cancelled = true;
                                Event::Cancelled
                            }
                            ProposeOutcome::Failed(brief) => {
                                fail_attempt(&mut retry, record, current, brief)
                            }
                        }
                    }
                }
                State::Write => {
                    let current = take_draft(&mut draft)?;
                    let Some(p) = proposal.as_ref() else {
                        return Err(EngineError::Git(anyhow!("WRITE entered without a proposal")));
                    };
                    match self.writer.apply(p, order) {
                        Ok(write) => {
                            debug!(paths = ?write.paths, "write applied");
                            applied = Some(write);
                            draft = Some(current);
                            Event::StageOk
                        }
                        Err(rejection) => {
                            let mut brief = FailureBrief::new(
                                current.number,
                                Stage::Write,
                                rejection.kind(),
                                rejection.to_string(),
                                format!("proposed files: {}", p.paths().join(", ")),
                            );
                            brief.detail = tail(&brief.detail, self.config.brief_output_limit_bytes);
                            fail_attempt(&mut retry, record, current, brief)
                        }
                    }
                }
                State::Verify => {
                    let mut current = take_draft(&mut draft)?;
                    let (commands, failure) = self.verify(order, current.number, run);
                    current.commands = commands;
                    match failure {
                        None => {
                            record.attempts.push(current.finish(Verdict::Pass, None));
                            Event::StageOk
                        }
                        Some(brief) => fail_attempt(&mut retry, record, current, brief),
                    }
                }
                State::Success | State::Failed => break,
            };

            let attempt = retry.attempts();
            match machine.advance(attempt, event)? {
                Effect::None => {}
                Effect::Commit => {
                    let write = applied.take().ok_or_else(|| {
                        EngineError::Git(anyhow!("commit requested without an applied write"))
                    })?;
                    let message = commit_message(order, proposal.as_ref());
                    match self.baseline.commit(baseline, &write.paths, &message) {
                        Ok(commit) => {
                            record.result_commit = Some(commit);
                            record.write_set = write.paths;
                        }
                        Err(err) => {
                            write.revert();
                            if let Err(rollback_err) = self.baseline.rollback(baseline) {
                                error!(err = %rollback_err, "rollback after failed commit failed");
                            }
                            return Err(EngineError::Git(err.context("commit write set")));
                        }
                    }
                }
                Effect::RollbackAndRetry | Effect::RollbackAndFail => {
                    proposal = None;
                    if let Some(write) = applied.take() {
                        write.revert();
                    }
                    self.baseline
                        .rollback(baseline)
                        .map_err(|err| EngineError::Git(err.context("rollback to baseline")))?;
                }
            }
        }

        debug!(transitions = machine.transitions().len(), "state machine finished");
        Ok(())
    }

    fn propose(
        &self,
        order: &WorkOrder,
        attempt: u32,
        retry: &RetryController,
        run: &RunArtifacts,
    ) -> ProposeOutcome {
        let oracle_error = |summary: &str, detail: String| {
            ProposeOutcome::Failed(FailureBrief::new(
                attempt,
                Stage::Propose,
                FailureKind::OracleError,
                summary,
                tail(&detail, self.config.brief_output_limit_bytes),
            ))
        };

        let snapshot = match context::capture(&self.root, order) {
            Ok(snapshot) => snapshot,
            Err(err) => return oracle_error("could not read context files", format!("{err:#}")),
        };
        let prompt = match render_proposal_prompt(&PromptInputs {
            order,
            snapshot: &snapshot,
            briefs: retry.briefs(),
            attempt,
            max_attempts: retry.max_attempts(),
            global_command: &self.config.verify.command,
        }) {
            Ok(prompt) => prompt,
            Err(err) => return oracle_error("could not render prompt", format!("{err:#}")),
        };
        run.write_attempt_file(attempt, "prompt.md", &prompt);

        let request = OracleRequest {
            work_order_id: order.id().to_string(),
            attempt,
            prompt,
            workdir: self.root.clone(),
            timeout: self.config.oracle_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
        };
        let response = match self.oracle.propose(&request, &self.cancel) {
            Ok(response) => response,
            Err(err) if err.downcast_ref::<Cancelled>().is_some() => {
                return ProposeOutcome::Cancelled;
            }
            Err(err) => {
                warn!(attempt, err = %err, "oracle call failed");
                run.write_attempt_file(attempt, "oracle.log", &format!("[oracle error] {err:#}\n"));
                return oracle_error("oracle call failed", format!("{err:#}"));
            }
        };
        run.write_attempt_file(
            attempt,
            "oracle.log",
            &tail(&response, self.config.output_limit_bytes),
        );

        match parse_proposal(&response, &snapshot) {
            ParseOutcome::Parsed(proposal) => {
                run.write_attempt_json(attempt, "proposal.json", &proposal);
                info!(attempt, files = proposal.files().len(), "proposal parsed");
                ProposeOutcome::Proposal(proposal)
            }
            ParseOutcome::ParseError(message) => {
                warn!(attempt, error = %message, "unparseable oracle response");
                oracle_error("oracle response could not be parsed", message)
            }
        }
    }

    /// Run the gate; returns every command result and the failure, if any.
    fn verify(
        &self,
        order: &WorkOrder,
        attempt: u32,
        run: &RunArtifacts,
    ) -> (Vec<CommandResult>, Option<FailureBrief>) {
        let global = &self.config.verify.command;
        let mut commands = vec![global.clone()];
        commands.extend(
            order
                .acceptance_commands()
                .iter()
                .filter(|argv| *argv != global)
                .cloned(),
        );
        let request = VerifyRequest {
            workdir: self.root.clone(),
            attempt,
            commands,
            timeout: self.config.command_timeout(),
            output_limit_bytes: self.config.output_limit_bytes,
            brief_output_limit_bytes: self.config.brief_output_limit_bytes,
        };

        match self.verifier.verify(&request) {
            Ok(report) => {
                run.write_attempt_file(attempt, "verify.log", &report.render_log());
                let failure = match (report.verdict, report.failure) {
                    (Verdict::Pass, _) => None,
                    (Verdict::Fail, Some(brief)) => Some(brief),
                    (Verdict::Fail, None) => Some(FailureBrief::new(
                        attempt,
                        Stage::Verify,
                        FailureKind::VerifyFail,
                        "verification failed",
                        "",
                    )),
                };
                (report.results, failure)
            }
            Err(err) => {
                warn!(attempt, err = %err, "verifier error");
                run.write_attempt_file(attempt, "verify.log", &format!("[verifier error] {err:#}\n"));
                let brief = FailureBrief::new(
                    attempt,
                    Stage::Verify,
                    FailureKind::LaunchError,
                    "verification could not run",
                    tail(&format!("{err:#}"), self.config.brief_output_limit_bytes),
                );
                (Vec::new(), Some(brief))
            }
        }
    }
}

/// Close a failed attempt and turn the retry decision into an event.
fn fail_attempt(
    retry: &mut RetryController,
    record: &mut RunRecord,
    draft: AttemptDraft,
    brief: FailureBrief,
) -> Event {
    warn!(
        attempt = brief.attempt,
        stage = %brief.stage,
        kind = %brief.kind,
        summary = %brief.summary,
        "attempt failed"
    );
    let decision = retry.record_failure(brief.clone());
    record.attempts.push(draft.finish(Verdict::Fail, Some(brief)));
    Event::StageFailed {
        retry: decision == RetryDecision::Retry,
    }
}

fn take_draft(draft: &mut Option<AttemptDraft>) -> Result<AttemptDraft, EngineError> {
    draft
        .take()
        .ok_or_else(|| EngineError::Git(anyhow!("stage entered without an open attempt")))
}

fn commit_message(order: &WorkOrder, proposal: Option<&WriteProposal>) -> String {
    let mut message = format!("{}: {}", order.id(), order.title());
    if let Some(summary) = proposal.and_then(WriteProposal::summary) {
        message.push_str("\n\n");
        message.push_str(summary);
    }
    message
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
