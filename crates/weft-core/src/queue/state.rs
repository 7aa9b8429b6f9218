//! Task lifecycle.

use serde::{Deserialize, Serialize};

/// State transitions:
/// - Scheduled -> Running -> Succeeded
/// - Scheduled -> Running -> Scheduled (failed, attempts remain)
/// - Scheduled -> Running -> Dead (terminal error or attempts exhausted)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    /// Waiting for its first or next attempt.
    Scheduled,

    /// An attempt is in flight.
    Running,

    Succeeded,

    /// Failed permanently.
    Dead,
}

impl TaskState {
    /// No further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Dead)
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TaskState::Succeeded.is_terminal());
        assert!(TaskState::Dead.is_terminal());
        assert!(!TaskState::Scheduled.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(TaskState::Scheduled.is_runnable());
        assert!(!TaskState::Running.is_runnable());
    }
}
