//! Errors returned by `Coordinator::run` before any task executes.

use thiserror::Error;

use steprun_core::TaskStatus;

use crate::config::ConfigError;
use crate::pool::PoolError;

/// Engine errors. Task and worker failures are never reported this way;
/// they end up on the returned Step.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run configuration is unusable.
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),

    /// A declared task names a type the registry does not know.
    #[error("Task '{task}' has unknown task type '{tag}'")]
    UnknownTaskType { task: String, tag: String },

    /// Two declared tasks share a name.
    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    /// A declared task has an empty name.
    #[error("Task name is empty")]
    EmptyName,

    /// A declared task is not PENDING.
    #[error("Task '{task}' is {status}, expected PENDING")]
    NotPending { task: String, status: TaskStatus },

    /// The worker pool could not be started.
    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),
}
