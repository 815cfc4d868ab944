//! Fatal engine errors.
//!
//! Recoverable stage failures never surface here; they become
//! [`FailureBrief`](crate::core::types::FailureBrief)s inside the run summary.

use thiserror::Error;

use crate::core::machine::IllegalTransition;
use crate::core::types::FailureKind;
use crate::core::validator::ValidationError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("work order validation failed: {}", join_errors(.0))]
    Schema(Vec<ValidationError>),
    #[error("work order input: {0:#}")]
    Input(anyhow::Error),
    #[error("git: {0:#}")]
    Git(anyhow::Error),
    #[error("config: {0:#}")]
    Config(anyhow::Error),
    #[error("run artifacts: {0:#}")]
    Artifact(anyhow::Error),
    #[error(transparent)]
    Transition(#[from] IllegalTransition),
}

impl EngineError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Schema(_) | Self::Input(_) | Self::Config(_) => FailureKind::SchemaError,
            Self::Git(_) | Self::Artifact(_) | Self::Transition(_) => FailureKind::GitError,
        }
    }
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::validator::ValidationErrorKind;

    #[test]
    fn schema_error_lists_every_problem() {
        let err = EngineError::Schema(vec![
            ValidationError::new(Some("WO-01"), "id", ValidationErrorKind::InvalidId, "bad"),
            ValidationError::new(None, "files", ValidationErrorKind::Schema, "missing"),
        ]);
        assert_eq!(err.kind(), FailureKind::SchemaError);
        assert_eq!(
            err.to_string(),
            "work order validation failed: WO-01: id: bad; files: missing"
        );
    }

    #[test]
    fn git_error_keeps_context_chain() {
        let source = anyhow::anyhow!("exit 128").context("git reset --hard");
        let err = EngineError::Git(source);
        assert_eq!(err.kind(), FailureKind::GitError);
        assert_eq!(err.to_string(), "git: git reset --hard: exit 128");
    }
}
