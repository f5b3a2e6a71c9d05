//! Status enums for Tasks and Steps, and failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of a Task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Task created but not yet dispatched to a worker.
    #[default]
    Pending,
    /// Task logic is executing on a worker.
    Running,
    /// Task logic finished and spawned subtasks that have not all finished.
    WaitingOnSubtasks,
    /// Task and all of its subtasks completed successfully.
    Done,
    /// Task logic failed, a subtask failed, or its worker was lost.
    Failed,
    /// Task was never dispatched because the run was halted.
    Skipped,
}

impl TaskStatus {
    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Returns true if the task counts as outstanding work.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::WaitingOnSubtasks)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Done)
                | (Running, Failed)
                | (Running, WaitingOnSubtasks)
                | (WaitingOnSubtasks, Done)
                | (WaitingOnSubtasks, Failed)
        )
    }

    /// Wire/manifest name of the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::WaitingOnSubtasks => "WAITING_ON_SUBTASKS",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a Step, derived from the statuses of its tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    /// Some tasks have not reached a terminal state yet.
    #[default]
    Running,
    /// Every task is DONE.
    Done,
    /// At least one task FAILED.
    Failed,
    /// The run was halted and tasks were skipped, but none failed.
    Aborted,
}

impl StepStatus {
    /// Returns true once the step can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "RUNNING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
            Self::Aborted => "ABORTED",
        };
        f.write_str(s)
    }
}

/// Classification of a task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Task logic itself failed.
    TaskExecution,
    /// Task configuration or output was invalid.
    TaskValidation,
    /// The worker process running the task terminated abnormally.
    WorkerCrash,
    /// The task was in flight when the run halted and its worker was stopped.
    Aborted,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::TaskExecution => "TaskExecutionError",
            Self::TaskValidation => "TaskValidationError",
            Self::WorkerCrash => "WorkerCrash",
            Self::Aborted => "Aborted",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_have_no_exit() {
        let all = [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::WaitingOnSubtasks,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Skipped,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn test_skip_only_before_dispatch() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Skipped));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Skipped));
        assert!(!TaskStatus::WaitingOnSubtasks.can_transition_to(TaskStatus::Skipped));
    }

    #[test]
    fn test_status_serde_names() {
        let json = serde_json::to_string(&TaskStatus::WaitingOnSubtasks).unwrap();
        assert_eq!(json, "\"WAITING_ON_SUBTASKS\"");
        assert_eq!(TaskStatus::WaitingOnSubtasks.as_str(), "WAITING_ON_SUBTASKS");
    }
}
