//! Run lifecycle state machine

use std::fmt;

use strongbox_core::{Error, Result};

/// Phase of a model run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Idle,
    PreHook,
    Enumerating,
    Piping,
    Uploading,
    Pruning,
    Done,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Forward transitions are strictly linear; any live state may fail
    pub fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Idle, PreHook)
            | (PreHook, Enumerating)
            | (Enumerating, Piping)
            | (Piping, Uploading)
            | (Uploading, Pruning)
            | (Pruning, Done) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::PreHook => "pre-hook",
            Self::Enumerating => "enumerating",
            Self::Piping => "piping",
            Self::Uploading => "uploading",
            Self::Pruning => "pruning",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks a run's state and rejects illegal transitions
#[derive(Debug, Clone)]
pub struct RunStateMachine {
    state: RunState,
    /// State the run was in when it failed
    failed_in: Option<RunState>,
}

impl Default for RunStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStateMachine {
    pub fn new() -> Self {
        Self {
            state: RunState::Idle,
            failed_in: None,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn failed_in(&self) -> Option<RunState> {
        self.failed_in
    }

    pub fn transition(&mut self, next: RunState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        if next == RunState::Failed {
            self.failed_in = Some(self.state);
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Failed` unless already terminal
    pub fn fail(&mut self) {
        if !self.state.is_terminal() {
            self.failed_in = Some(self.state);
            self.state = RunState::Failed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path() {
        let mut machine = RunStateMachine::new();
        for next in [
            RunState::PreHook,
            RunState::Enumerating,
            RunState::Piping,
            RunState::Uploading,
            RunState::Pruning,
            RunState::Done,
        ] {
            machine.transition(next).unwrap();
        }
        assert_eq!(machine.state(), RunState::Done);
        assert_eq!(machine.failed_in(), None);
    }

    #[test]
    fn test_rejects_skipping_ahead() {
        let mut machine = RunStateMachine::new();
        let err = machine.transition(RunState::Uploading).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(machine.state(), RunState::Idle);
    }

    #[test]
    fn test_every_live_state_can_fail() {
        for state in [
            RunState::Idle,
            RunState::PreHook,
            RunState::Enumerating,
            RunState::Piping,
            RunState::Uploading,
            RunState::Pruning,
        ] {
            assert!(state.can_transition_to(RunState::Failed), "{state}");
        }
        assert!(!RunState::Done.can_transition_to(RunState::Failed));
        assert!(!RunState::Failed.can_transition_to(RunState::Failed));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut machine = RunStateMachine::new();
        machine.transition(RunState::PreHook).unwrap();
        machine.fail();
        assert_eq!(machine.state(), RunState::Failed);
        assert_eq!(machine.failed_in(), Some(RunState::PreHook));
        assert!(machine.transition(RunState::Enumerating).is_err());

        machine.fail();
        assert_eq!(machine.failed_in(), Some(RunState::PreHook));
    }
}
