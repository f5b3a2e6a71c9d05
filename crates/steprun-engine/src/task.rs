//! Task logic interfaces.
//!
//! A task type is implemented either as a [`BlockingTask`], run to
//! completion by direct invocation, or as a [`CooperativeTask`], driven on
//! the worker's single-threaded event loop. The coordinator never sees the
//! difference; only the worker does.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use steprun_core::{Artifact, FailureKind, FailureReason, TaskId, TaskSpec};

use crate::storage::{AsyncStorage, LocalStorage, Storage, StorageError};

/// Errors raised by task logic.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task logic failed.
    #[error("{0}")]
    Execution(String),

    /// Task arguments or produced output were invalid.
    #[error("{0}")]
    Validation(String),

    /// A storage operation failed while running.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl TaskError {
    /// Failure classification for the task's manifest record.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Validation(_) => FailureKind::TaskValidation,
            Self::Execution(_) | Self::Storage(_) => FailureKind::TaskExecution,
        }
    }

    /// Convert into the reason reported to the coordinator.
    pub fn into_reason(self) -> FailureReason {
        FailureReason::new(self.kind(), self.to_string())
    }
}

/// What a task hands back after a successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Subtasks to spawn; the task waits for all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subtasks: Vec<TaskSpec>,

    /// Artifacts produced.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<Artifact>,

    /// Free-form information for the manifest.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub result: Map<String, Value>,
}

impl TaskOutput {
    /// Builder method to add a subtask.
    pub fn with_subtask(mut self, spec: TaskSpec) -> Self {
        self.subtasks.push(spec);
        self
    }

    /// Builder method to add an artifact.
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Builder method to add a result entry.
    pub fn with_result(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }
}

/// Everything task logic may touch while it runs.
#[derive(Clone)]
pub struct TaskContext {
    /// Id of the running task.
    pub task_id: TaskId,

    /// Declared name of the running task.
    pub task_name: String,

    /// Directory relative locations resolve against.
    pub work_path: PathBuf,

    storage: Arc<LocalStorage>,
}

impl TaskContext {
    /// Create a context backed by local storage under `work_path`.
    pub fn new(task_id: TaskId, task_name: impl Into<String>, work_path: impl Into<PathBuf>) -> Self {
        let work_path = work_path.into();
        Self {
            task_id,
            task_name: task_name.into(),
            storage: Arc::new(LocalStorage::new(work_path.clone())),
            work_path,
        }
    }

    /// Blocking storage handle.
    pub fn storage(&self) -> &dyn Storage {
        self.storage.as_ref()
    }

    /// Cooperative storage handle.
    pub fn async_storage(&self) -> &dyn AsyncStorage {
        self.storage.as_ref()
    }
}

/// Task logic executed by direct invocation.
pub trait BlockingTask: Send {
    /// Run the task.
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;

    /// Check what `run` produced. Errors are validation failures.
    fn validate(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// Task logic driven on the worker's cooperative event loop.
#[async_trait]
pub trait CooperativeTask: Send {
    /// Run the task.
    async fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError>;

    /// Check what `run` produced. Errors are validation failures.
    async fn validate(&mut self, _ctx: &TaskContext) -> Result<(), TaskError> {
        Ok(())
    }
}

/// How a task type is executed inside the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Blocking,
    Cooperative,
}

/// Constructed task logic, ready to run.
pub enum TaskLogic {
    Blocking(Box<dyn BlockingTask>),
    Cooperative(Box<dyn CooperativeTask>),
}

impl TaskLogic {
    /// Execution mode of this logic.
    pub fn mode(&self) -> ExecutionMode {
        match self {
            Self::Blocking(_) => ExecutionMode::Blocking,
            Self::Cooperative(_) => ExecutionMode::Cooperative,
        }
    }
}

/// Deserialize a spec's argument bag into a typed argument struct.
///
/// Malformed arguments are a validation failure.
pub fn parse_args<T: DeserializeOwned>(spec: &TaskSpec) -> Result<T, TaskError> {
    serde_json::from_value(Value::Object(spec.args.clone()))
        .map_err(|e| TaskError::Validation(format!("invalid arguments for '{}': {e}", spec.name)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Args {
        who: String,
    }

    #[test]
    fn test_parse_args_ok() {
        let spec = TaskSpec::new("hello_world a").with_arg("who", "alice");
        let args: Args = parse_args(&spec).unwrap();
        assert_eq!(args.who, "alice");
    }

    #[test]
    fn test_parse_args_missing_field_is_validation_error() {
        let spec = TaskSpec::new("hello_world a");
        let err = parse_args::<Args>(&spec).unwrap_err();
        assert_eq!(err.kind(), FailureKind::TaskValidation);
        assert!(err.to_string().contains("hello_world a"));
    }

    #[test]
    fn test_storage_error_is_execution_failure() {
        let err = TaskError::from(StorageError::NotFound("x".into()));
        let reason = err.into_reason();
        assert_eq!(reason.kind, FailureKind::TaskExecution);
        assert_eq!(reason.message, "Not found: x");
    }
}
