use std::fmt;

use serde::{Deserialize, Serialize};

/// The states of the job container.
///
/// A job flows through: LOAD_RESOURCES → ENSURE_RESOURCES_READY → EXECUTE →
/// ACTIVATE_PARALLEL → ACTIVATE_NEXT_IN_FLOW → COMPLETED, never moving
/// backwards except from ACTIVATE_PARALLEL into EXECUTE when an async signal
/// resumes the job. FAILED is entered from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobState {
    LoadResources,
    EnsureResourcesReady,
    Execute,
    ActivateParallel,
    ActivateNextInFlow,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::LoadResources => write!(f, "LOAD_RESOURCES"),
            JobState::EnsureResourcesReady => write!(f, "ENSURE_RESOURCES_READY"),
            JobState::Execute => write!(f, "EXECUTE"),
            JobState::ActivateParallel => write!(f, "ACTIVATE_PARALLEL"),
            JobState::ActivateNextInFlow => write!(f, "ACTIVATE_NEXT_IN_FLOW"),
            JobState::Completed => write!(f, "COMPLETED"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_display() {
        assert_eq!(JobState::LoadResources.to_string(), "LOAD_RESOURCES");
        assert_eq!(JobState::EnsureResourcesReady.to_string(), "ENSURE_RESOURCES_READY");
        assert_eq!(JobState::ActivateNextInFlow.to_string(), "ACTIVATE_NEXT_IN_FLOW");
        assert_eq!(JobState::Failed.to_string(), "FAILED");
    }

    #[test]
    fn only_completed_and_failed_are_terminal() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(!JobState::Execute.is_terminal());
        assert!(!JobState::ActivateParallel.is_terminal());
    }
}
