//! Oracle prompt rendering.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::types::{FailureBrief, WorkOrder};
use crate::io::context::ContextSnapshot;

const PROPOSAL_TEMPLATE: &str = include_str!("prompts/proposal.md");

/// Writable path with the base hash the oracle must echo back.
#[derive(Debug, Clone, Serialize)]
struct WritableFile<'a> {
    path: &'a str,
    hash: Option<&'a str>,
}

/// Everything the proposal prompt is built from.
#[derive(Debug, Clone, Copy)]
pub struct PromptInputs<'a> {
    pub order: &'a WorkOrder,
    pub snapshot: &'a ContextSnapshot,
    /// Every failure brief of earlier attempts, oldest first.
    pub briefs: &'a [FailureBrief],
    pub attempt: u32,
    pub max_attempts: u32,
    /// Global verification command, shown ahead of the acceptance commands.
    pub global_command: &'a [String],
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("proposal", PROPOSAL_TEMPLATE)
            .context("load proposal template")?;
        Ok(Self { env })
    }

    fn render_proposal(&self, input: &PromptInputs<'_>) -> Result<String> {
        let order = input.order;
        let writable: Vec<WritableFile<'_>> = order
            .allowed_files()
            .iter()
            .map(|path| WritableFile {
                path,
                hash: input
                    .snapshot
                    .base_hash(path)
                    .and_then(|hash| hash.as_deref()),
            })
            .collect();
        let commands: Vec<String> = std::iter::once(input.global_command)
            .chain(order.acceptance_commands().iter().map(Vec::as_slice))
            .map(display_argv)
            .collect();

        let template = self.env.get_template("proposal")?;
        let rendered = template.render(context! {
            id => order.id(),
            title => order.title(),
            intent => order.intent(),
            notes => order.notes(),
            writable => writable,
            forbidden => order.forbidden(),
            context => &input.snapshot.files,
            commands => commands,
            briefs => input.briefs,
            attempt => input.attempt,
            max_attempts => input.max_attempts,
        })?;
        Ok(rendered)
    }
}

/// Render the proposal prompt for one attempt.
pub fn render_proposal_prompt(input: &PromptInputs<'_>) -> Result<String> {
    let engine = PromptEngine::new()?;
    let rendered = engine
        .render_proposal(input)
        .context("render proposal prompt")?;
    debug!(
        attempt = input.attempt,
        briefs = input.briefs.len(),
        bytes = rendered.len(),
        "rendered proposal prompt"
    );
    Ok(rendered)
}

fn display_argv(argv: &[String]) -> String {
    shlex::try_join(argv.iter().map(String::as_str)).unwrap_or_else(|_| argv.join(" "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash::content_hash;
    use crate::core::types::{FailureKind, Stage, WorkOrderDocument};
    use crate::core::validator::{ValidationRules, validate};
    use crate::io::context::ContextFile;

    fn order() -> WorkOrder {
        let doc = WorkOrderDocument {
            id: "WO-03".to_string(),
            title: "Greeting".to_string(),
            intent: "Make main print hello".to_string(),
            allowed_files: vec!["src/main.rs".to_string(), "src/new.rs".to_string()],
            forbidden: vec!["Cargo.lock".to_string()],
            context_files: vec!["README.md".to_string()],
            acceptance_commands: vec![vec![
                "sh".to_string(),
                "scripts/verify.sh".to_string(),
            ]],
            notes: Some("keep it short".to_string()),
        };
        validate(&doc, &ValidationRules::default()).expect("valid")
    }

    fn snapshot() -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::default();
        snapshot.files.push(ContextFile {
            path: "README.md".to_string(),
            content: Some("# Demo".to_string()),
            hash: Some(content_hash(b"# Demo")),
        });
        snapshot
            .base_hashes
            .insert("src/main.rs".to_string(), Some(content_hash(b"fn main() {}")));
        snapshot.base_hashes.insert("src/new.rs".to_string(), None);
        snapshot
    }

    fn global() -> Vec<String> {
        vec!["sh".to_string(), "scripts/verify.sh".to_string()]
    }

    #[test]
    fn first_attempt_prompt_has_intent_context_and_hashes() {
        let order = order();
        let snapshot = snapshot();
        let global = global();
        let prompt = render_proposal_prompt(&PromptInputs {
            order: &order,
            snapshot: &snapshot,
            briefs: &[],
            attempt: 1,
            max_attempts: 3,
            global_command: &global,
        })
        .expect("render");

        assert!(prompt.contains("Make main print hello"));
        assert!(prompt.contains("keep it short"));
        assert!(prompt.contains("# Demo"));
        assert!(prompt.contains(&content_hash(b"fn main() {}")));
        assert!(prompt.contains("`src/new.rs` base_hash: null"));
        assert!(prompt.contains("`Cargo.lock`"));
        assert!(prompt.contains("- `sh scripts/verify.sh`"));
        assert!(!prompt.contains("Previous failed attempts"));
    }

    #[test]
    fn retry_prompt_carries_every_brief() {
        let order = order();
        let snapshot = snapshot();
        let global = global();
        let mut verify = FailureBrief::new(
            1,
            Stage::Verify,
            FailureKind::VerifyFail,
            "command exited with 1",
            "assertion failed: greeting",
        );
        verify.command = Some(global.clone());
        verify.exit_code = Some(1);
        let scope = FailureBrief::new(
            2,
            Stage::Write,
            FailureKind::ScopeViolation,
            "b.txt is not in allowed_files",
            "",
        );
        let briefs = vec![verify, scope];

        let prompt = render_proposal_prompt(&PromptInputs {
            order: &order,
            snapshot: &snapshot,
            briefs: &briefs,
            attempt: 3,
            max_attempts: 3,
            global_command: &global,
        })
        .expect("render");

        assert!(prompt.contains("Attempt 3 of 3"));
        assert!(prompt.contains("Attempt 1: VERIFY_FAIL during VERIFY"));
        assert!(prompt.contains("assertion failed: greeting"));
        assert!(prompt.contains("(exit 1)"));
        assert!(prompt.contains("Attempt 2: SCOPE_VIOLATION during WRITE"));
    }
}
