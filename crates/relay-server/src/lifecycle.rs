//! Relay lifecycle states.

use thiserror::Error;
use tokio::sync::watch;

/// Lifecycle state. Transitions are strictly linear.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
}

impl LifecycleState {
    /// The only state this one may move to.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Created => Some(Self::Starting),
            Self::Starting => Some(Self::Running),
            Self::Running => Some(Self::ShuttingDown),
            Self::ShuttingDown => Some(Self::Stopped),
            Self::Stopped => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Observable lifecycle state machine.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self { state }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::InvalidTransition`] unless `to` directly
    /// follows the current state.
    pub fn advance(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut result = Ok(());
        self.state.send_if_modified(|state| {
            if state.next() == Some(to) {
                *state = to;
                true
            } else {
                result = Err(LifecycleError::InvalidTransition { from: *state, to });
                false
            }
        });
        result
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_transitions() {
        let lifecycle = Lifecycle::new();
        assert_eq!(lifecycle.state(), LifecycleState::Created);

        for state in [
            LifecycleState::Starting,
            LifecycleState::Running,
            LifecycleState::ShuttingDown,
            LifecycleState::Stopped,
        ] {
            lifecycle.advance(state).unwrap();
            assert_eq!(lifecycle.state(), state);
        }
    }

    #[test]
    fn test_rejects_skipped_state() {
        let lifecycle = Lifecycle::new();
        assert_eq!(
            lifecycle.advance(LifecycleState::Running),
            Err(LifecycleError::InvalidTransition {
                from: LifecycleState::Created,
                to: LifecycleState::Running,
            })
        );
        assert_eq!(lifecycle.state(), LifecycleState::Created);
    }

    #[test]
    fn test_rejects_going_back() {
        let lifecycle = Lifecycle::new();
        lifecycle.advance(LifecycleState::Starting).unwrap();
        lifecycle.advance(LifecycleState::Running).unwrap();

        assert!(lifecycle.advance(LifecycleState::Starting).is_err());
        assert!(lifecycle.advance(LifecycleState::Running).is_err());
        assert_eq!(lifecycle.state(), LifecycleState::Running);
    }

    #[test]
    fn test_stopped_is_terminal() {
        assert_eq!(LifecycleState::Stopped.next(), None);
    }
}
