//! Core domain errors.

use thiserror::Error;

use crate::TaskStatus;

/// Core domain errors for steprun.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Invalid state transition.
    #[error("Invalid state transition for task '{task}': {from} -> {to}")]
    InvalidStateTransition {
        task: String,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// A task was declared with an empty name, so it has no type tag.
    #[error("Task name is empty")]
    EmptyName,
}
