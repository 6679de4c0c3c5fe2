//! Operation lifecycle states and the transition rules between them.
//!
//! ```text
//! Uninitialized -> InProgress -> { TimedOut | Canceled } -> Finished
//! ```
//!
//! `Finished` may be reached from any state. No state is ever entered twice,
//! so the history of one operation holds at most one entry per state.

use std::fmt;

use thiserror::Error;

/// Lifecycle state of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpState {
    /// Created, not yet started.
    Uninitialized,
    /// Registered and being driven by the reactor.
    InProgress,
    /// Its timeout fired; completion is pending.
    TimedOut,
    /// The caller canceled it; completion is pending.
    Canceled,
    /// Its callback has been dispatched.
    Finished,
}

impl OpState {
    /// Name used in diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpState::Uninitialized => "UNINITIALIZED",
            OpState::InProgress => "IN_PROGRESS",
            OpState::TimedOut => "TIMED_OUT",
            OpState::Canceled => "CANCELED",
            OpState::Finished => "DONE",
        }
    }
}

impl fmt::Display for OpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capacity of a state history: one slot per state.
pub const MAX_STATE_HISTORY: usize = 5;

/// A transition the lifecycle does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid operation state transition {from} -> {to} (history: {history})")]
pub struct TransitionError {
    /// State before the attempted transition.
    pub from: OpState,
    /// State that was requested.
    pub to: OpState,
    /// Rendered history at the time of the attempt.
    pub history: String,
}

/// Ordered record of every state an operation has entered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateHistory {
    states: [OpState; MAX_STATE_HISTORY],
    len: usize,
}

impl StateHistory {
    /// A history holding only `Uninitialized`.
    pub fn new() -> Self {
        Self {
            states: [OpState::Uninitialized; MAX_STATE_HISTORY],
            len: 1,
        }
    }

    /// Most recent state.
    pub fn current(&self) -> OpState {
        self.states[self.len - 1]
    }

    /// Whether `state` was ever entered.
    pub fn contains(&self, state: OpState) -> bool {
        self.as_slice().contains(&state)
    }

    /// States in the order they were entered.
    pub fn as_slice(&self) -> &[OpState] {
        &self.states[..self.len]
    }

    /// Checks whether moving to `next` is allowed.
    pub fn check(&self, next: OpState) -> Result<(), TransitionError> {
        let current = self.current();
        let allowed = !self.contains(next)
            && match next {
                OpState::Uninitialized => false,
                OpState::InProgress => current == OpState::Uninitialized,
                OpState::TimedOut | OpState::Canceled => current == OpState::InProgress,
                OpState::Finished => true,
            };
        if allowed {
            Ok(())
        } else {
            Err(TransitionError {
                from: current,
                to: next,
                history: self.to_string(),
            })
        }
    }

    /// Records `next` if the transition is allowed.
    pub fn record(&mut self, next: OpState) -> Result<(), TransitionError> {
        self.check(next)?;
        self.states[self.len] = next;
        self.len += 1;
        Ok(())
    }
}

impl Default for StateHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StateHistory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, state) in self.as_slice().iter().enumerate() {
            if i > 0 {
                f.write_str(" -> ")?;
            }
            f.write_str(state.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_history() {
        let history = StateHistory::new();
        assert_eq!(history.current(), OpState::Uninitialized);
        assert_eq!(history.as_slice(), &[OpState::Uninitialized]);
    }

    #[test]
    fn test_happy_path() {
        let mut history = StateHistory::new();
        history.record(OpState::InProgress).unwrap();
        history.record(OpState::Finished).unwrap();
        assert_eq!(history.to_string(), "UNINITIALIZED -> IN_PROGRESS -> DONE");
    }

    #[test]
    fn test_cancel_then_finish() {
        let mut history = StateHistory::new();
        history.record(OpState::InProgress).unwrap();
        history.record(OpState::Canceled).unwrap();
        history.record(OpState::Finished).unwrap();
        assert_eq!(history.current(), OpState::Finished);
    }

    #[test]
    fn test_finish_from_uninitialized() {
        let mut history = StateHistory::new();
        assert!(history.record(OpState::Finished).is_ok());
    }

    #[test]
    fn test_cancel_requires_in_progress() {
        let mut history = StateHistory::new();
        let err = history.record(OpState::Canceled).unwrap_err();
        assert_eq!(err.from, OpState::Uninitialized);
        assert_eq!(err.to, OpState::Canceled);
    }

    #[test]
    fn test_timeout_after_cancel_rejected() {
        let mut history = StateHistory::new();
        history.record(OpState::InProgress).unwrap();
        history.record(OpState::Canceled).unwrap();
        assert!(history.record(OpState::TimedOut).is_err());
    }

    #[test]
    fn test_no_reentry() {
        let mut history = StateHistory::new();
        history.record(OpState::InProgress).unwrap();
        history.record(OpState::Finished).unwrap();
        assert!(history.record(OpState::Finished).is_err());
        assert!(history.record(OpState::InProgress).is_err());
        assert!(history.record(OpState::Uninitialized).is_err());
    }

    #[test]
    fn test_in_progress_only_after_uninitialized() {
        let mut history = StateHistory::new();
        history.record(OpState::Finished).unwrap();
        let err = history.record(OpState::InProgress).unwrap_err();
        assert!(err.to_string().contains("DONE -> IN_PROGRESS"));
    }
}

#[cfg(test)]
mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    fn any_state() -> impl Strategy<Value = OpState> {
        prop_oneof![
            Just(OpState::Uninitialized),
            Just(OpState::InProgress),
            Just(OpState::TimedOut),
            Just(OpState::Canceled),
            Just(OpState::Finished),
        ]
    }

    proptest! {
        #[test]
        fn test_history_stays_monotonic(attempts in proptest::collection::vec(any_state(), 0..20)) {
            let mut history = StateHistory::new();
            for next in attempts {
                let _ = history.record(next);
            }
            let states = history.as_slice();
            for (i, s) in states.iter().enumerate() {
                prop_assert!(!states[i + 1..].contains(s), "state {} entered twice", s);
            }
            if let Some(pos) = states.iter().position(|s| *s == OpState::InProgress) {
                prop_assert_eq!(pos, 1);
            }
            for (i, s) in states.iter().enumerate() {
                if matches!(s, OpState::TimedOut | OpState::Canceled) {
                    prop_assert_eq!(states[i - 1], OpState::InProgress);
                }
            }
        }
    }
}
