//! Step: a named collection of tasks executed as one unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Declaration, StepStatus, Task, TaskId, TaskSpec, TaskStatus, WorkerId};

/// Something that went wrong during a run without being a task failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Diagnostic {
    /// The manifest sink failed to record an event.
    ManifestWrite {
        task: Option<TaskId>,
        message: String,
    },
    /// A worker exited in a way not attributable to a task.
    WorkerExited { worker: WorkerId, message: String },
    /// A worker sent something the coordinator could not use.
    Protocol { worker: WorkerId, message: String },
}

/// A named, ordered collection of tasks.
///
/// `tasks` holds every task of the run in creation order: the declared
/// top-level tasks first, then subtasks as they are spawned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step name.
    pub name: String,

    /// All tasks, top-level and spawned.
    pub tasks: Vec<Task>,

    /// When the coordinator started running the step.
    pub started_at: Option<DateTime<Utc>>,

    /// When the coordinator finished running the step.
    pub finished_at: Option<DateTime<Utc>>,

    /// Non-task problems observed during the run.
    pub diagnostics: Vec<Diagnostic>,
}

impl Step {
    /// Create an empty step.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Create a step from declared top-level specs, in order.
    pub fn from_specs(
        name: impl Into<String>,
        specs: impl IntoIterator<Item = TaskSpec>,
    ) -> Result<Self, CoreError> {
        let mut step = Self::new(name);
        for spec in specs {
            step.add_task(spec)?;
        }
        Ok(step)
    }

    /// Append a top-level task.
    pub fn add_task(&mut self, spec: TaskSpec) -> Result<TaskId, CoreError> {
        let index = self.top_level().count() as u32;
        let task = Task::from_spec(spec, Declaration::top_level(index))?;
        let id = task.id.clone();
        self.tasks.push(task);
        Ok(id)
    }

    /// Top-level tasks in declaration order.
    pub fn top_level(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter().filter(|t| t.is_top_level())
    }

    /// Look up a task by id.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }

    /// Look up a task by declared name.
    pub fn by_name(&self, name: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.name == name)
    }

    /// Direct subtasks of `id`, in spawn order.
    pub fn subtasks_of(&self, id: &TaskId) -> Vec<&Task> {
        match self.get(id) {
            Some(parent) => parent
                .subtasks
                .iter()
                .filter_map(|child| self.get(child))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Number of tasks currently in `status`.
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Derived step status.
    pub fn status(&self) -> StepStatus {
        if self.tasks.iter().any(|t| t.status == TaskStatus::Failed) {
            StepStatus::Failed
        } else if self.tasks.iter().all(|t| t.status == TaskStatus::Done) {
            StepStatus::Done
        } else if self.tasks.iter().all(Task::is_terminal) {
            StepStatus::Aborted
        } else {
            StepStatus::Running
        }
    }

    /// False when some manifest write failed during the run, meaning the
    /// persisted manifest may not match this snapshot.
    pub fn manifest_complete(&self) -> bool {
        !self
            .diagnostics
            .iter()
            .any(|d| matches!(d, Diagnostic::ManifestWrite { .. }))
    }
}
