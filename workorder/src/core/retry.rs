//! Attempt accounting and failure-brief accumulation for one work order.

use crate::core::types::FailureBrief;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry,
    Exhausted,
}

/// Bounds attempts and keeps every failure brief of the work order.
///
/// Briefs are append-only; each new attempt sees all earlier ones.
#[derive(Debug, Clone)]
pub struct RetryController {
    max_attempts: u32,
    attempts: u32,
    briefs: Vec<FailureBrief>,
}

impl RetryController {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            attempts: 0,
            briefs: Vec::new(),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Start the next attempt and return its 1-indexed number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts = self.attempts.saturating_add(1);
        self.attempts
    }

    /// Record a failed attempt and decide whether another one may start.
    pub fn record_failure(&mut self, brief: FailureBrief) -> RetryDecision {
        let recoverable = brief.kind.is_recoverable();
        self.briefs.push(brief);
        if recoverable && self.attempts < self.max_attempts {
            RetryDecision::Retry
        } else {
            RetryDecision::Exhausted
        }
    }

    pub fn briefs(&self) -> &[FailureBrief] {
        &self.briefs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{FailureKind, Stage};

    fn brief(attempt: u32, kind: FailureKind) -> FailureBrief {
        FailureBrief::new(attempt, Stage::Verify, kind, "failed", "detail")
    }

    #[test]
    fn retries_until_max_attempts() {
        let mut retry = RetryController::new(3);
        let mut decisions = Vec::new();
        for _ in 0..3 {
            let n = retry.begin_attempt();
            decisions.push(retry.record_failure(brief(n, FailureKind::VerifyFail)));
        }
        assert_eq!(
            decisions,
            vec![
                RetryDecision::Retry,
                RetryDecision::Retry,
                RetryDecision::Exhausted
            ]
        );
        assert_eq!(retry.briefs().len(), 3);
        assert_eq!(retry.briefs()[2].attempt, 3);
    }

    #[test]
    fn fatal_kind_is_never_retried() {
        let mut retry = RetryController::new(3);
        let n = retry.begin_attempt();
        assert_eq!(
            retry.record_failure(brief(n, FailureKind::GitError)),
            RetryDecision::Exhausted
        );
    }

    #[test]
    fn zero_max_attempts_still_allows_one_attempt() {
        let mut retry = RetryController::new(0);
        assert_eq!(retry.max_attempts(), 1);
        assert_eq!(retry.begin_attempt(), 1);
    }
}
