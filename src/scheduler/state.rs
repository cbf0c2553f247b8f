//! Session lifecycle state machine.
//!
//! ```text
//! Idle ──start──▶ Running ──stop / fatal error──▶ Stopping ──task exit──▶ Stopped
//!  ▲                                                                        │
//!  └───────────────────────────── acknowledge ──────────────────────────────┘
//! ```
//!
//! `start` is also accepted from `Stopped`; the scheduler walks through `Idle`
//! first so no transition ever skips a state.

use thiserror::Error;

/// Lifecycle state of the polling scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// No session; manual instrument operations allowed
    #[default]
    Idle,
    /// A polling task owns the instrument
    Running,
    /// Cancellation requested, waiting for the task to exit
    Stopping,
    /// Task has exited and `Terminated` was emitted
    Stopped,
}

impl SessionState {
    /// Returns true for the states a new session may be started from.
    pub fn can_start(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Stopped)
    }

    /// Returns true when the instrument is not owned by a polling task.
    pub fn allows_manual_operation(self) -> bool {
        self.can_start()
    }

    fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Running, Stopping) | (Stopping, Stopped) | (Stopped, Idle)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A transition that is not an edge of the lifecycle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid session state transition: {from} -> {to}")]
pub struct InvalidTransition {
    /// State the machine was in
    pub from: SessionState,
    /// State that was requested
    pub to: SessionState,
}

/// Holds the current [`SessionState`] and only permits the edges of the lifecycle.
#[derive(Debug, Default)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to `next`, rejecting any edge that is not part of the lifecycle.
    pub fn transition(&mut self, next: SessionState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        tracing::debug!("Session state {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_full_lifecycle() {
        let mut machine = SessionStateMachine::default();
        assert_eq!(machine.state(), Idle);
        for next in [Running, Stopping, Stopped, Idle] {
            machine.transition(next).unwrap();
            assert_eq!(machine.state(), next);
        }
    }

    #[test]
    fn test_no_state_is_skipped() {
        let mut machine = SessionStateMachine::default();
        assert_eq!(
            machine.transition(Stopped),
            Err(InvalidTransition {
                from: Idle,
                to: Stopped
            })
        );

        machine.transition(Running).unwrap();
        assert!(machine.transition(Stopped).is_err());
        assert!(machine.transition(Idle).is_err());
        assert_eq!(machine.state(), Running);
    }

    #[test]
    fn test_start_and_manual_guards() {
        assert!(Idle.can_start());
        assert!(Stopped.can_start());
        assert!(!Running.can_start());
        assert!(!Stopping.allows_manual_operation());
    }

    #[test]
    fn test_transition_error_display() {
        let err = InvalidTransition {
            from: Running,
            to: Idle,
        };
        assert_eq!(
            err.to_string(),
            "Invalid session state transition: Running -> Idle"
        );
    }
}
