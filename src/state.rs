use std::fmt;
use std::sync::Arc;

/// Lifecycle of a promise. Moves out of `Pending` at most once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Pending,
    Resolved,
    Rejected,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            State::Pending => "pending",
            State::Resolved => "resolved",
            State::Rejected => "rejected",
        })
    }
}

/// The settled value of a promise.
///
/// Values are kept behind an `Arc` so every observer, executor task and
/// derived promise shares the one value that was stored on settlement.
#[derive(Debug)]
pub enum Outcome<D, F> {
    Resolved(Arc<D>),
    Rejected(Arc<F>),
}

impl<D, F> Clone for Outcome<D, F> {
    fn clone(&self) -> Self {
        match self {
            Outcome::Resolved(value) => Outcome::Resolved(Arc::clone(value)),
            Outcome::Rejected(value) => Outcome::Rejected(Arc::clone(value)),
        }
    }
}

impl<D, F> Outcome<D, F> {
    pub fn state(&self) -> State {
        match self {
            Outcome::Resolved(_) => State::Resolved,
            Outcome::Rejected(_) => State::Rejected,
        }
    }

    pub fn resolved(&self) -> Option<&D> {
        match self {
            Outcome::Resolved(value) => Some(&**value),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejected(&self) -> Option<&F> {
        match self {
            Outcome::Resolved(_) => None,
            Outcome::Rejected(value) => Some(&**value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Outcome, State};
    use std::sync::Arc;

    #[test]
    fn test_outcome_accessors() {
        let done: Outcome<i32, String> = Outcome::Resolved(Arc::new(7));
        assert_eq!(done.state(), State::Resolved);
        assert_eq!(done.resolved(), Some(&7));
        assert_eq!(done.rejected(), None);

        let fail: Outcome<i32, String> = Outcome::Rejected(Arc::new("💥".into()));
        assert_eq!(fail.state(), State::Rejected);
        assert_eq!(fail.resolved(), None);
        assert_eq!(fail.rejected().map(String::as_str), Some("💥"));
    }

    #[test]
    fn test_outcome_clone_shares_value() {
        let value = Arc::new(String::from("🍓"));
        let outcome: Outcome<String, ()> = Outcome::Resolved(value.clone());
        let copy = outcome.clone();
        match (outcome, copy) {
            (Outcome::Resolved(a), Outcome::Resolved(b)) => assert!(Arc::ptr_eq(&a, &b)),
            _ => unreachable!(),
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
