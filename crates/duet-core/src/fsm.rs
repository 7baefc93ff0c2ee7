//! Table-driven state machines
//!
//! A state type lists its legal moves in [`Transitions::next`]; [`Machine`]
//! is the only place a state changes, so every transition of the relay and
//! client connection lifecycles goes through one check.

use std::fmt;

/// Transition table of a state enum
pub trait Transitions: Copy + Eq + fmt::Debug {
    type Event: Copy + fmt::Debug;

    /// Next state for `event`, or `None` if the move is not allowed
    fn next(self, event: Self::Event) -> Option<Self>;

    /// Terminal states accept no further events
    fn is_terminal(self) -> bool {
        false
    }
}

/// A rejected transition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TransitionError<S, E> {
    pub from: S,
    pub event: E,
}

impl<S: fmt::Debug, E: fmt::Debug> fmt::Display for TransitionError<S, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid transition from {:?} on {:?}", self.from, self.event)
    }
}

impl<S: fmt::Debug, E: fmt::Debug> std::error::Error for TransitionError<S, E> {}

/// Current state plus the table that guards it
#[derive(Clone, Debug)]
pub struct Machine<S> {
    state: S,
}

impl<S: Transitions> Machine<S> {
    pub fn new(initial: S) -> Self {
        Self { state: initial }
    }

    pub fn state(&self) -> S {
        self.state
    }

    /// Apply `event`. On rejection the state is left unchanged.
    pub fn fire(&mut self, event: S::Event) -> Result<S, TransitionError<S, S::Event>> {
        let rejected = TransitionError {
            from: self.state,
            event,
        };
        if self.state.is_terminal() {
            return Err(rejected);
        }
        match self.state.next(event) {
            Some(next) => {
                self.state = next;
                Ok(next)
            }
            None => Err(rejected),
        }
    }

    /// Whether `event` would be accepted right now
    pub fn can_fire(&self, event: S::Event) -> bool {
        !self.state.is_terminal() && self.state.next(event).is_some()
    }
}
