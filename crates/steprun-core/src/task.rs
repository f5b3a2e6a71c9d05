//! Task, TaskSpec and failure reasons.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{Artifact, CoreError, FailureKind, TaskId, TaskStatus};

/// Declared form of a task: a name whose first token is the type tag, plus
/// an argument bag that only the task logic interprets.
///
/// In YAML the arguments sit next to the name:
///
/// ```yaml
/// - name: hello_world greet alice
///   who: alice
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Declared task name, unique within a step.
    pub name: String,

    /// Task arguments.
    #[serde(flatten)]
    pub args: Map<String, Value>,
}

impl TaskSpec {
    /// Create a spec with no arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Map::new(),
        }
    }

    /// Builder method to add an argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// The type tag: first whitespace-separated token of the name.
    pub fn tag(&self) -> Option<&str> {
        self.name.split_whitespace().next()
    }
}

/// Position of a task in declaration order.
///
/// Top-level task `i` sits at `[i]`, the `j`-th subtask of a task at `p`
/// sits at `p ++ [j]`. Lexicographic comparison puts subtasks right after
/// their parent and before later top-level tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Declaration(Vec<u32>);

impl Declaration {
    /// Position of the `index`-th top-level task.
    pub fn top_level(index: u32) -> Self {
        Self(vec![index])
    }

    /// Position of the `index`-th subtask spawned by the task at `self`.
    pub fn child(&self, index: u32) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    /// Nesting depth, 1 for top-level tasks.
    pub fn depth(&self) -> usize {
        self.0.len()
    }
}

impl PartialOrd for Declaration {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Declaration {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("."))
    }
}

/// Why a task ended up FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    /// Error classification.
    pub kind: FailureKind,

    /// Human-readable message, verbatim from the failing component.
    pub message: String,

    /// Name of the task where the failure originated, when it was
    /// propagated up from a subtask.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl FailureReason {
    /// Create a new FailureReason.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            origin: None,
        }
    }

    /// Task logic failed.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TaskExecution, message)
    }

    /// Task configuration or output was invalid.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(FailureKind::TaskValidation, message)
    }

    /// The worker executing the task died.
    pub fn worker_crash(message: impl Into<String>) -> Self {
        Self::new(FailureKind::WorkerCrash, message)
    }

    /// The task was cut short by halt mode.
    pub fn aborted(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Aborted, message)
    }

    /// The reason a parent inherits when `failed_task` fails under it.
    /// Keeps the innermost origin so the root cause survives several levels.
    pub fn propagated_from(&self, failed_task: &str) -> Self {
        Self {
            kind: self.kind,
            message: self.message.clone(),
            origin: Some(
                self.origin
                    .clone()
                    .unwrap_or_else(|| failed_task.to_string()),
            ),
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(origin) = &self.origin {
            write!(f, " (in subtask '{origin}')")?;
        }
        Ok(())
    }
}

/// A unit of work within a Step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier.
    pub id: TaskId,

    /// Declared name.
    pub name: String,

    /// Type tag selecting the task logic.
    pub tag: String,

    /// Arguments handed to the task logic.
    pub args: Map<String, Value>,

    /// Current status.
    pub status: TaskStatus,

    /// Task that spawned this one, absent for top-level tasks.
    pub parent: Option<TaskId>,

    /// Subtasks spawned by this task, in spawn order.
    pub subtasks: Vec<TaskId>,

    /// Set on the transition into FAILED.
    pub failure_reason: Option<FailureReason>,

    /// When the task was dispatched to a worker.
    pub started_at: Option<DateTime<Utc>>,

    /// When the task reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Position in declaration order.
    pub declaration: Declaration,

    /// Free-form information set by the task logic.
    pub result: Map<String, Value>,

    /// Artifacts produced by the task logic.
    pub artifacts: Vec<Artifact>,
}

impl Task {
    /// Create a PENDING task from its declared spec.
    pub fn from_spec(spec: TaskSpec, declaration: Declaration) -> Result<Self, CoreError> {
        let tag = spec.tag().ok_or(CoreError::EmptyName)?.to_string();
        Ok(Self {
            id: TaskId::generate(),
            name: spec.name,
            tag,
            args: spec.args,
            status: TaskStatus::Pending,
            parent: None,
            subtasks: Vec::new(),
            failure_reason: None,
            started_at: None,
            finished_at: None,
            declaration,
            result: Map::new(),
            artifacts: Vec::new(),
        })
    }

    /// Builder method to set the parent task.
    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent = Some(parent);
        self
    }

    /// The spec this task was created from.
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }

    /// Move to `next`, enforcing the state machine and stamping times.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidStateTransition {
                task: self.name.clone(),
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        if next == TaskStatus::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Move to FAILED and record why.
    pub fn fail(&mut self, reason: FailureReason) -> Result<(), CoreError> {
        self.transition(TaskStatus::Failed)?;
        self.failure_reason = Some(reason);
        Ok(())
    }

    /// Check if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if this is a top-level task.
    pub fn is_top_level(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(name: &str) -> Task {
        Task::from_spec(TaskSpec::new(name), Declaration::top_level(0)).unwrap()
    }

    #[test]
    fn test_tag_is_first_token() {
        let t = task("hello_world   greet alice");
        assert_eq!(t.tag, "hello_world");
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn test_empty_name_rejected() {
        let err = Task::from_spec(TaskSpec::new("   "), Declaration::top_level(0)).unwrap_err();
        assert!(matches!(err, CoreError::EmptyName));
    }

    #[test]
    fn test_transitions_stamp_times() {
        let mut t = task("sleep a");
        t.transition(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        assert!(t.finished_at.is_none());
        t.transition(TaskStatus::WaitingOnSubtasks).unwrap();
        t.transition(TaskStatus::Done).unwrap();
        assert!(t.finished_at.is_some());
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut t = task("sleep a");
        let err = t.transition(TaskStatus::Done).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InvalidStateTransition {
                from: TaskStatus::Pending,
                to: TaskStatus::Done,
                ..
            }
        ));
        assert_eq!(t.status, TaskStatus::Pending);
    }

    #[test]
    fn test_fail_records_reason() {
        let mut t = task("fail a");
        t.transition(TaskStatus::Running).unwrap();
        t.fail(FailureReason::execution("boom")).unwrap();
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.failure_reason.unwrap().to_string(), "TaskExecutionError: boom");
    }

    #[test]
    fn test_declaration_order() {
        let first = Declaration::top_level(0);
        let second = Declaration::top_level(1);
        let child = first.child(0);
        let grandchild = child.child(3);
        assert!(first < child);
        assert!(child < grandchild);
        assert!(grandchild < second);
        assert_eq!(grandchild.to_string(), "0.0.3");
        assert_eq!(grandchild.depth(), 3);
    }

    #[test]
    fn test_propagated_reason_keeps_root_cause() {
        let leaf = FailureReason::execution("disk full");
        let mid = leaf.propagated_from("copy a");
        let top = mid.propagated_from("explode x");
        assert_eq!(top.origin.as_deref(), Some("copy a"));
        assert_eq!(top.kind, FailureKind::TaskExecution);
        assert_eq!(top.message, "disk full");
    }

    #[test]
    fn test_spec_flattens_args() {
        let spec: TaskSpec =
            serde_json::from_str(r#"{"name":"hello_world x","who":"alice"}"#).unwrap();
        assert_eq!(spec.tag(), Some("hello_world"));
        assert_eq!(spec.args.get("who").and_then(Value::as_str), Some("alice"));
    }
}
