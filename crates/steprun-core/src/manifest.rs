//! Manifest entry models: the persisted provenance of steps and tasks.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{FailureReason, Step, StepStatus, Task, TaskId, TaskStatus};

/// Something a task produced, tracked from source to destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Where the artifact came from.
    pub source: String,

    /// Where the artifact ended up.
    pub destination: String,
}

impl Artifact {
    /// Create a new Artifact.
    pub fn new(source: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// One recorded status change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub status: TaskStatus,
    pub at: DateTime<Utc>,
}

/// Manifest entry for a single task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskManifest {
    pub id: TaskId,
    pub name: String,
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<TaskId>,
    pub status: TaskStatus,
    /// Every recorded status, oldest first. Starts with PENDING.
    pub transitions: Vec<TransitionRecord>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub result: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl TaskManifest {
    /// Entry for a freshly created task.
    pub fn created(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            name: task.name.clone(),
            tag: task.tag.clone(),
            parent: task.parent.clone(),
            status: task.status,
            transitions: vec![TransitionRecord {
                status: task.status,
                at: Utc::now(),
            }],
            started_at: task.started_at,
            finished_at: task.finished_at,
            failure_reason: task.failure_reason.clone(),
            result: task.result.clone(),
            artifacts: task.artifacts.clone(),
        }
    }

    /// Fold a status change into the entry.
    pub fn apply(&mut self, task: &Task, status: TaskStatus, failure: Option<&FailureReason>) {
        self.status = status;
        self.transitions.push(TransitionRecord {
            status,
            at: Utc::now(),
        });
        self.started_at = task.started_at;
        self.finished_at = task.finished_at;
        if let Some(reason) = failure {
            self.failure_reason = Some(reason.clone());
        }
        self.result = task.result.clone();
        self.artifacts = task.artifacts.clone();
    }

    /// Statuses in recorded order.
    pub fn history(&self) -> Vec<TaskStatus> {
        self.transitions.iter().map(|t| t.status).collect()
    }

    /// Seconds between dispatch and the terminal state.
    pub fn elapsed(&self) -> Option<f64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds() as f64 / 1000.0),
            _ => None,
        }
    }
}

/// Manifest entry for a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepManifest {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskManifest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,
}

impl StepManifest {
    /// Create an empty entry for step `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Find a task entry by id.
    pub fn task(&self, id: &TaskId) -> Option<&TaskManifest> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Find a task entry by id for update.
    pub fn task_mut(&mut self, id: &TaskId) -> Option<&mut TaskManifest> {
        self.tasks.iter_mut().find(|t| &t.id == id)
    }

    /// Overwrite the summary fields from a finished step.
    pub fn summarize(&mut self, step: &Step) {
        self.status = step.status();
        self.started_at = step.started_at;
        self.finished_at = step.finished_at;
        self.artifacts = step
            .tasks
            .iter()
            .flat_map(|t| t.artifacts.iter().cloned())
            .collect();
    }
}

/// Top-level manifest document covering every step run in a work path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RootManifest {
    pub status: StepStatus,
    pub started_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub steps: BTreeMap<String, StepManifest>,
}

impl Default for RootManifest {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Running,
            started_at: now,
            modified_at: now,
            steps: BTreeMap::new(),
        }
    }
}

impl RootManifest {
    /// Recompute the overall status from the step entries.
    pub fn recalculate(&mut self) {
        let steps: Vec<StepStatus> = self.steps.values().map(|s| s.status).collect();
        self.status = if steps
            .iter()
            .any(|s| matches!(s, StepStatus::Failed | StepStatus::Aborted))
        {
            StepStatus::Failed
        } else if !steps.is_empty() && steps.iter().all(|s| *s == StepStatus::Done) {
            StepStatus::Done
        } else {
            StepStatus::Running
        };
        self.modified_at = Utc::now();
    }

    /// Entry for step `name`, created when missing.
    pub fn step_mut(&mut self, name: &str) -> &mut StepManifest {
        self.steps
            .entry(name.to_string())
            .or_insert_with(|| StepManifest::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Declaration, TaskSpec};

    #[test]
    fn test_task_manifest_history() {
        let mut task =
            Task::from_spec(TaskSpec::new("hello_world a"), Declaration::top_level(0)).unwrap();
        let mut entry = TaskManifest::created(&task);
        task.transition(TaskStatus::Running).unwrap();
        entry.apply(&task, TaskStatus::Running, None);
        task.transition(TaskStatus::Done).unwrap();
        entry.apply(&task, TaskStatus::Done, None);

        assert_eq!(
            entry.history(),
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done]
        );
        assert!(entry.elapsed().is_some());
    }

    #[test]
    fn test_root_status_recalculation() {
        let mut root = RootManifest::default();
        root.step_mut("a").status = StepStatus::Done;
        root.recalculate();
        assert_eq!(root.status, StepStatus::Done);

        root.step_mut("b").status = StepStatus::Aborted;
        root.recalculate();
        assert_eq!(root.status, StepStatus::Failed);
    }
}
