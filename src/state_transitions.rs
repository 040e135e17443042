//! A table-driven guard for state machines with a fixed set of legal
//! transitions, used by the connection pool and other driver state holders.

use std::{collections::HashMap, fmt::Debug, hash::Hash};

use crate::error::{Error, Result};

/// A "state changed" notification committed by a successful transition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct StateChange<S> {
    pub(crate) from: S,
    pub(crate) to: S,
}

/// Maps each state to the set of states legally reachable from it. The guard
/// holds no state of its own beyond the table; callers pass the state being
/// guarded into [`StateTransitions::transition`].
#[derive(Clone, Debug)]
pub(crate) struct StateTransitions<S> {
    legal: HashMap<S, Vec<S>>,
}

impl<S: Copy + Eq + Hash + Debug> StateTransitions<S> {
    pub(crate) fn new(table: impl IntoIterator<Item = (S, Vec<S>)>) -> Self {
        Self {
            legal: table.into_iter().collect(),
        }
    }

    /// Attempts the transition `*current -> to`. An illegal transition leaves
    /// `current` unchanged and fails with an invariant-violation error naming
    /// both states and the legal set; a legal one commits the new state and
    /// returns the change record for the caller to broadcast.
    pub(crate) fn transition(&self, current: &mut S, to: S) -> Result<StateChange<S>> {
        let legal = self.legal.get(current).map(Vec::as_slice).unwrap_or(&[]);
        if !legal.contains(&to) {
            return Err(Error::internal(format!(
                "illegal state transition from {:?} to {:?}; legal transitions from {:?} are {:?}",
                current, to, current, legal,
            )));
        }
        let change = StateChange {
            from: *current,
            to,
        };
        *current = to;
        Ok(change)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum TestState {
        A,
        B,
        C,
    }
    use TestState::*;

    fn table() -> StateTransitions<TestState> {
        StateTransitions::new([(A, vec![B]), (B, vec![A, C])])
    }

    #[test]
    fn illegal_transition_leaves_state_unchanged() {
        let transitions = table();
        let mut state = A;
        let err = transitions.transition(&mut state, C).unwrap_err();
        assert_eq!(state, A);
        let message = err.to_string();
        assert!(message.contains("A"), "{}", message);
        assert!(message.contains("C"), "{}", message);
        assert!(message.contains("[B]"), "{}", message);
    }

    #[test]
    fn legal_transitions_commit_and_report() {
        let transitions = table();
        let mut state = A;
        let change = transitions.transition(&mut state, B).unwrap();
        assert_eq!((change.from, change.to), (A, B));
        let change = transitions.transition(&mut state, C).unwrap();
        assert_eq!((change.from, change.to), (B, C));
        assert_eq!(state, C);
    }

    #[test]
    fn terminal_state_has_no_transitions() {
        let transitions = table();
        let mut state = C;
        assert!(transitions.transition(&mut state, A).is_err());
        assert_eq!(state, C);
    }
}
