//! Execution state machine for one work order.
//!
//! Transitions are a pure function of the current state and the stage event;
//! [`ExecutionMachine`] wraps it with the current state and a transition log.
//!
//! ```text
//! PROPOSE --ok--> WRITE --ok--> VERIFY --ok--> SUCCESS   (commit)
//!    |              |             |
//!    +--- failed, retry ---------+----> PROPOSE          (rollback)
//!    +--- failed, exhausted -----+----> FAILED           (rollback)
//! PROPOSE --cancelled--> FAILED                          (rollback)
//! ```

use std::fmt;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Propose,
    Write,
    Verify,
    Success,
    Failed,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Propose => "PROPOSE",
            Self::Write => "WRITE",
            Self::Verify => "VERIFY",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Result of the stage that ran in the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Event {
    StageOk,
    /// `retry` carries the retry controller's decision.
    StageFailed { retry: bool },
    /// Cancellation observed at the PROPOSE boundary.
    Cancelled,
}

/// Side effect the caller must perform when taking a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    None,
    Commit,
    RollbackAndRetry,
    RollbackAndFail,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition from {from} on {event:?}")]
pub struct IllegalTransition {
    pub from: State,
    pub event: Event,
}

/// The transition table.
pub fn transition(state: State, event: Event) -> Result<(State, Effect), IllegalTransition> {
    let next = match (state, event) {
        (State::Propose, Event::StageOk) => (State::Write, Effect::None),
        (State::Write, Event::StageOk) => (State::Verify, Effect::None),
        (State::Verify, Event::StageOk) => (State::Success, Effect::Commit),
        (State::Propose | State::Write | State::Verify, Event::StageFailed { retry: true }) => {
            (State::Propose, Effect::RollbackAndRetry)
        }
        (State::Propose | State::Write | State::Verify, Event::StageFailed { retry: false })
        | (State::Propose, Event::Cancelled) => (State::Failed, Effect::RollbackAndFail),
        (from, event) => return Err(IllegalTransition { from, event }),
    };
    Ok(next)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub attempt: u32,
    pub from: State,
    pub to: State,
    pub event: Event,
    pub effect: Effect,
}

/// Current state plus the log of every transition taken.
#[derive(Debug, Clone)]
pub struct ExecutionMachine {
    current: State,
    transitions: Vec<TransitionRecord>,
}

impl Default for ExecutionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionMachine {
    pub fn new() -> Self {
        Self {
            current: State::Propose,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> State {
        self.current
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Take the transition for `event` and return the effect to perform.
    pub fn advance(&mut self, attempt: u32, event: Event) -> Result<Effect, IllegalTransition> {
        let (to, effect) = transition(self.current, event)?;
        debug!(attempt, from = %self.current, to = %to, ?effect, "state transition");
        self.transitions.push(TransitionRecord {
            attempt,
            from: self.current,
            to,
            event,
            effect,
        });
        self.current = to;
        Ok(effect)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_commits_after_verify() {
        let mut machine = ExecutionMachine::new();
        assert_eq!(machine.advance(1, Event::StageOk), Ok(Effect::None));
        assert_eq!(machine.advance(1, Event::StageOk), Ok(Effect::None));
        assert_eq!(machine.advance(1, Event::StageOk), Ok(Effect::Commit));
        assert_eq!(machine.current(), State::Success);
        assert_eq!(machine.transitions().len(), 3);
    }

    #[test]
    fn failure_with_retry_returns_to_propose_from_every_stage() {
        for state in [State::Propose, State::Write, State::Verify] {
            assert_eq!(
                transition(state, Event::StageFailed { retry: true }),
                Ok((State::Propose, Effect::RollbackAndRetry))
            );
            assert_eq!(
                transition(state, Event::StageFailed { retry: false }),
                Ok((State::Failed, Effect::RollbackAndFail))
            );
        }
    }

    #[test]
    fn cancellation_is_only_observed_at_propose() {
        assert_eq!(
            transition(State::Propose, Event::Cancelled),
            Ok((State::Failed, Effect::RollbackAndFail))
        );
        assert!(transition(State::Write, Event::Cancelled).is_err());
        assert!(transition(State::Verify, Event::Cancelled).is_err());
    }

    #[test]
    fn terminal_states_accept_no_events() {
        for state in [State::Success, State::Failed] {
            assert!(transition(state, Event::StageOk).is_err());
            assert!(transition(state, Event::StageFailed { retry: true }).is_err());
        }
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let mut machine = ExecutionMachine::new();
        machine.advance(1, Event::StageOk).expect("propose ok");
        let err = machine.advance(1, Event::Cancelled).unwrap_err();
        assert_eq!(err.from, State::Write);
        assert_eq!(machine.current(), State::Write);
        assert_eq!(machine.transitions().len(), 1);
    }
}
