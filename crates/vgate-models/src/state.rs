//! Job lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job state in the ledger.
///
/// ```text
/// Pending --admit--> Admitted --dispatch--> Running --> Succeeded | Failed
/// Running --worker unhealthy--> Pending
/// Admitted --worker restarted--> Pending
/// Pending --attempts exhausted--> Failed
/// Pending | Admitted --cancel--> Cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for GPU capacity
    #[default]
    Pending,
    /// Capacity reserved on a worker, not yet started
    Admitted,
    /// Executing on a worker
    Running,
    /// Finished with an artifact
    Succeeded,
    /// Finished with an error
    Failed,
    /// Cancelled before it started running
    Cancelled,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Admitted,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Admitted => "admitted",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a job in this state holds a GPU reservation.
    pub fn holds_reservation(&self) -> bool {
        matches!(self, JobState::Admitted | JobState::Running)
    }

    /// Check whether `self -> next` is an edge of the lifecycle.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Admitted)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Admitted, Running)
                | (Admitted, Pending)
                | (Admitted, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Pending)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when parsing an unknown state name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state: {0}")]
pub struct UnknownState(pub String);

impl FromStr for JobState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| UnknownState(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Succeeded.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn test_lifecycle_edges() {
        assert!(JobState::Pending.can_transition_to(JobState::Admitted));
        assert!(JobState::Admitted.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Pending));
        assert!(JobState::Pending.can_transition_to(JobState::Failed));

        // Running jobs are cancelled cooperatively and end Failed
        assert!(!JobState::Running.can_transition_to(JobState::Cancelled));
        assert!(!JobState::Pending.can_transition_to(JobState::Running));
        assert!(!JobState::Succeeded.can_transition_to(JobState::Pending));
    }

    #[test]
    fn test_no_edges_leave_terminal_states() {
        for from in JobState::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobState::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_parse_round_trip() {
        for state in JobState::ALL {
            assert_eq!(state.as_str().parse::<JobState>().unwrap(), state);
        }
        assert!("processing".parse::<JobState>().is_err());
    }
}
