//! steprun Core Domain Types
//!
//! This crate contains pure domain types with no dependencies on:
//! - Worker processes or the wire protocol
//! - Filesystem or manifest storage
//! - Runtime specifics
//!
//! Everything here describes a Step, its Tasks and their lifecycle.

pub mod error;
pub mod ids;
pub mod manifest;
pub mod status;
pub mod step;
pub mod task;

// Re-export commonly used types
pub use error::CoreError;
pub use ids::{TaskId, WorkerId};
pub use manifest::{Artifact, RootManifest, StepManifest, TaskManifest, TransitionRecord};
pub use status::{FailureKind, StepStatus, TaskStatus};
pub use step::{Diagnostic, Step};
pub use task::{Declaration, FailureReason, Task, TaskSpec};
