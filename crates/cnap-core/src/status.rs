//! Status enums for Agents, Tasks, Runners, and Run steps.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// Lifecycle status of a Task record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Task created but not yet dispatched.
    #[default]
    Pending,
    /// Task dispatched to a Runner.
    Running,
    /// Task completed successfully.
    Completed,
    /// Task failed.
    Failed,
    /// Task was canceled by an operator.
    Canceled,
}

impl TaskStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [TaskStatus; 5] = [
        Self::Pending,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Canceled,
    ];

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Whether a task may move from `self` to `next`.
    ///
    /// Terminal states have no outgoing transitions.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && *self != next
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::UnknownVariant {
                kind: "task status",
                value: s.to_string(),
            })
    }
}

/// Status of a Runner's execution state machine.
///
/// ```text
/// Pending -> Running -> {Completed, Failed, Canceled}
///               |  ^
///               v  |
///             Unknown
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    /// Runner created, nothing started yet.
    #[default]
    Pending,
    /// Backend started or invocation in flight.
    Running,
    /// Execution finished successfully.
    Completed,
    /// Execution failed.
    Failed,
    /// Execution was canceled.
    Canceled,
    /// Backend unreachable or reported an unrecognized status.
    Unknown,
}

impl RunnerStatus {
    /// Returns true if the runner is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Returns true if the runner is still live (not terminal).
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Self-transitions are not transitions and return false.
    pub fn can_transition_to(&self, next: RunnerStatus) -> bool {
        use RunnerStatus::*;
        match (*self, next) {
            (a, b) if a == b => false,
            (Completed | Failed | Canceled, _) => false,
            (_, Pending) => false,
            (Pending, Unknown) => false,
            (Pending | Running | Unknown, _) => true,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Unknown => "unknown",
        }
    }

    /// The task status mirrored for this runner status, if any.
    pub fn as_task_status(&self) -> Option<TaskStatus> {
        match self {
            Self::Pending => Some(TaskStatus::Pending),
            Self::Running => Some(TaskStatus::Running),
            Self::Completed => Some(TaskStatus::Completed),
            Self::Failed => Some(TaskStatus::Failed),
            Self::Canceled => Some(TaskStatus::Canceled),
            Self::Unknown => None,
        }
    }
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of an Agent record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[default]
    Active,
    Idle,
    Busy,
    /// Soft-deleted; treated as absent for new tasks.
    Deleted,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a single run step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStepStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

/// Kind of work a run step records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStepType {
    System,
    Tool,
    Model,
    Checkpoint,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_runner_transitions() {
        use RunnerStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Canceled));
        assert!(!Pending.can_transition_to(Unknown));
        assert!(Running.can_transition_to(Unknown));
        assert!(Unknown.can_transition_to(Running));
        assert!(!Running.can_transition_to(Running));
        assert!(!Running.can_transition_to(Pending));

        for terminal in [Completed, Failed, Canceled] {
            assert!(terminal.is_terminal());
            for next in [Pending, Running, Completed, Failed, Canceled, Unknown] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_task_status_parse() {
        assert_eq!("canceled".parse::<TaskStatus>(), Ok(TaskStatus::Canceled));
        assert!("cancelled".parse::<TaskStatus>().is_err());
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Canceled));
    }

    #[test]
    fn test_unknown_has_no_task_status() {
        assert_eq!(RunnerStatus::Unknown.as_task_status(), None);
        assert_eq!(
            RunnerStatus::Failed.as_task_status(),
            Some(TaskStatus::Failed)
        );
    }
}
