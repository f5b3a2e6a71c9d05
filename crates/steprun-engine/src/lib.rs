//! steprun execution engine.
//!
//! The [`Coordinator`] runs a [`Step`](steprun_core::Step) by handing its
//! tasks to a [`WorkerPool`] of `steprun-worker` processes, following the
//! task state machine, and mirroring every transition to a
//! [`ManifestWriter`]. The worker side of the protocol lives in [`worker`].

pub mod config;
pub mod coordinator;
pub mod error;
pub mod manifest;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod storage;
pub mod task;
pub mod tasks;
pub mod worker;

pub use config::{ConfigError, PipelineConfig, RunConfig, MIN_POOL_SIZE};
pub use coordinator::Coordinator;
pub use error::EngineError;
pub use manifest::{JsonManifest, ManifestError, ManifestRecord, ManifestWriter, MemoryManifest};
pub use pool::{ExitKind, PoolError, PoolEvent, WorkerPool};
pub use protocol::{CoordinatorMessage, ProtocolError, TaskAssignment, TaskOutcome, WorkerMessage};
pub use registry::{RegistryError, TaskFactory, TaskRegistry};
pub use storage::{AsyncStorage, LocalStorage, Storage, StorageError};
pub use task::{
    BlockingTask, CooperativeTask, ExecutionMode, TaskContext, TaskError, TaskLogic, TaskOutput,
};
pub use tasks::builtin_registry;
pub use worker::{Worker, WorkerConfig};
