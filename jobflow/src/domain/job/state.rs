//! Job lifecycle state machine.

use serde::{Deserialize, Serialize};

use crate::Error;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Constructed, not yet picked up by the setup queue.
    #[default]
    Incoming,
    /// Running the setup (input validation) phase.
    SetupRunning,
    /// Setup succeeded; queued for execution.
    Waiting,
    /// Executing the workflow steps.
    Running,
    /// Execution finished successfully.
    Success,
    /// Execution failed.
    Failed,
    /// Cancelled by a user or the engine.
    Canceled,
    /// Setup failed. Can be restarted.
    Dead,
}

impl JobState {
    /// Convert to database string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Incoming => "INCOMING",
            Self::SetupRunning => "SETUP_RUNNING",
            Self::Waiting => "WAITING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Dead => "DEAD",
        }
    }

    /// Parse from database string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INCOMING" => Some(Self::Incoming),
            "SETUP_RUNNING" => Some(Self::SetupRunning),
            "WAITING" => Some(Self::Waiting),
            "RUNNING" => Some(Self::Running),
            "SUCCESS" => Some(Self::Success),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            "DEAD" => Some(Self::Dead),
            _ => None,
        }
    }

    /// No further transition happens without an explicit restart.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled | Self::Dead)
    }

    /// Queued or running in one of the two stages.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Incoming | Self::SetupRunning | Self::Waiting | Self::Running
        )
    }

    /// Only dead jobs can be restarted.
    pub fn is_restartable(&self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Validate a state transition.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        match (self, target) {
            // Same state is always allowed
            (from, to) if from == &to => true,

            (Incoming, SetupRunning) => true,
            (SetupRunning, Waiting | Dead) => true,
            (Waiting, Running) => true,
            (Running, Success | Failed) => true,

            // Restart
            (Dead, SetupRunning) => true,

            // Anything queued or running can be cancelled
            (Incoming | SetupRunning | Waiting | Running, Canceled) => true,

            _ => false,
        }
    }

    /// Attempt to transition to a new state.
    pub fn transition_to(&self, target: JobState) -> Result<JobState, Error> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(Error::InvalidStateTransition {
                from: self.as_str().to_string(),
                to: target.as_str().to_string(),
            })
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
