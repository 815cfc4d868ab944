//! Orchestration for `workorder run`: validate a batch, pick the working
//! branch, then execute work orders one after another.
//!
//! Execution stops at the first work order that does not succeed; the rest
//! are reported as skipped.

use anyhow::Context;
use tracing::{debug, info, instrument, warn};

use crate::core::types::{RunSummary, RunVerdict, WorkOrder, WorkOrderDocument};
use crate::core::validator::validate_batch;
use crate::engine::Engine;
use crate::errors::EngineError;
use crate::exit_codes;
use crate::io::config::EngineConfig;
use crate::io::git::Git;
use crate::io::oracle::Oracle;
use crate::io::verify::Verifier;

const PROTECTED_BRANCHES: [&str; 2] = ["main", "master"];

/// Outcome of a batch run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOutcome {
    pub branch: String,
    /// One summary per executed work order, in order.
    pub summaries: Vec<RunSummary>,
    /// Ids not executed because an earlier work order failed.
    pub skipped: Vec<String>,
}

impl BatchOutcome {
    pub fn succeeded(&self) -> bool {
        self.skipped.is_empty()
            && self
                .summaries
                .iter()
                .all(|summary| summary.verdict == RunVerdict::Success)
    }

    pub fn cancelled(&self) -> bool {
        self.summaries.iter().any(|summary| summary.cancelled)
    }

    /// Process exit code for this outcome.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled() {
            exit_codes::CANCELLED
        } else if self.succeeded() {
            exit_codes::OK
        } else {
            exit_codes::FAILED
        }
    }
}

/// Validate `docs` as one batch, then run them in `engine`'s repository.
///
/// `branch` names the working branch; without it the current branch is used,
/// unless that is `main`/`master`, in which case `<branch_prefix><short-sha>`
/// is created from HEAD.
#[instrument(skip_all, fields(orders = docs.len()))]
pub fn run_batch<O: Oracle + ?Sized, V: Verifier + ?Sized>(
    engine: &Engine<'_, O, V>,
    config: &EngineConfig,
    docs: &[WorkOrderDocument],
    branch: Option<&str>,
) -> Result<BatchOutcome, EngineError> {
    let orders = validate_batch(docs, &config.validation_rules()).map_err(EngineError::Schema)?;

    let git = Git::new(engine.root());
    let branch = prepare_branch(&git, config, branch).map_err(EngineError::Git)?;
    info!(branch = %branch, "working branch ready");

    run_orders(engine, &orders, branch)
}

fn run_orders<O: Oracle + ?Sized, V: Verifier + ?Sized>(
    engine: &Engine<'_, O, V>,
    orders: &[WorkOrder],
    branch: String,
) -> Result<BatchOutcome, EngineError> {
    let mut outcome = BatchOutcome {
        branch,
        summaries: Vec::with_capacity(orders.len()),
        skipped: Vec::new(),
    };
    let mut remaining = orders.iter();
    for order in remaining.by_ref() {
        let summary = engine.run_work_order(order)?;
        let stop = summary.verdict != RunVerdict::Success;
        outcome.summaries.push(summary);
        if stop {
            warn!(work_order = %order.id(), "work order failed; stopping batch");
            break;
        }
    }
    outcome.skipped = remaining.map(|order| order.id().to_string()).collect();
    Ok(outcome)
}

/// Check out (or create) the working branch and return its name.
fn prepare_branch(
    git: &Git,
    config: &EngineConfig,
    requested: Option<&str>,
) -> anyhow::Result<String> {
    let current = git.current_branch()?;
    let target = match requested {
        Some(name) => {
            if PROTECTED_BRANCHES.contains(&name) {
                anyhow::bail!("refusing to run on protected branch {name}");
            }
            name.to_string()
        }
        None if PROTECTED_BRANCHES.contains(&current.as_str()) => {
            format!("{}{}", config.branch_prefix, git.head_short_sha(8)?)
        }
        None => return Ok(current),
    };

    if current == target {
        debug!(branch = %target, "already on working branch");
    } else if git.branch_exists(&target)? {
        git.ensure_clean()
            .context("switching branches requires a clean working tree")?;
        git.checkout_branch(&target)
            .with_context(|| format!("checkout existing branch {target}"))?;
    } else {
        info!(branch = %target, "creating working branch");
        git.checkout_new_branch(&target)
            .with_context(|| format!("create branch {target}"))?;
    }
    Ok(target)
}
