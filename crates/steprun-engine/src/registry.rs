//! Task registry: maps a type tag to the factory for its logic.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use steprun_core::TaskSpec;

use crate::task::{BlockingTask, CooperativeTask, ExecutionMode, TaskError, TaskLogic};

/// Registry errors.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No task type is registered under this tag.
    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),
}

type BuildFn = dyn Fn(&TaskSpec) -> Result<TaskLogic, TaskError> + Send + Sync;

/// Constructor for one task type.
#[derive(Clone)]
pub struct TaskFactory {
    mode: ExecutionMode,
    build: Arc<BuildFn>,
}

impl TaskFactory {
    /// How tasks of this type execute.
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Build the logic for `spec`. Errors are validation failures.
    pub fn build(&self, spec: &TaskSpec) -> Result<TaskLogic, TaskError> {
        (self.build)(spec)
    }
}

impl fmt::Debug for TaskFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFactory").field("mode", &self.mode).finish()
    }
}

/// Tag to factory mapping.
#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type run by direct invocation.
    pub fn register_blocking<T, F>(&mut self, tag: impl Into<String>, factory: F) -> &mut Self
    where
        T: BlockingTask + 'static,
        F: Fn(&TaskSpec) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        let build = move |spec: &TaskSpec| -> Result<TaskLogic, TaskError> {
            Ok(TaskLogic::Blocking(Box::new(factory(spec)?)))
        };
        self.insert(tag.into(), ExecutionMode::Blocking, Arc::new(build))
    }

    /// Register a task type driven on the cooperative event loop.
    pub fn register_cooperative<T, F>(&mut self, tag: impl Into<String>, factory: F) -> &mut Self
    where
        T: CooperativeTask + 'static,
        F: Fn(&TaskSpec) -> Result<T, TaskError> + Send + Sync + 'static,
    {
        let build = move |spec: &TaskSpec| -> Result<TaskLogic, TaskError> {
            Ok(TaskLogic::Cooperative(Box::new(factory(spec)?)))
        };
        self.insert(tag.into(), ExecutionMode::Cooperative, Arc::new(build))
    }

    fn insert(&mut self, tag: String, mode: ExecutionMode, build: Arc<BuildFn>) -> &mut Self {
        self.factories.insert(tag, TaskFactory { mode, build });
        self
    }

    /// Look up the factory for a type tag.
    pub fn resolve(&self, tag: &str) -> Result<&TaskFactory, RegistryError> {
        self.factories
            .get(tag)
            .ok_or_else(|| RegistryError::UnknownTaskType(tag.to_string()))
    }

    /// Check if a tag is registered.
    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    /// Registered tags with their execution mode, sorted by tag.
    pub fn tags(&self) -> impl Iterator<Item = (&str, ExecutionMode)> {
        self.factories.iter().map(|(tag, f)| (tag.as_str(), f.mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskContext, TaskOutput};
    use async_trait::async_trait;

    struct Noop;

    impl BlockingTask for Noop {
        fn run(&mut self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::default())
        }
    }

    struct Wait;

    #[async_trait]
    impl CooperativeTask for Wait {
        async fn run(&mut self, _ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
            Ok(TaskOutput::default())
        }
    }

    #[test]
    fn test_resolve_registered_types() {
        let mut registry = TaskRegistry::new();
        registry
            .register_blocking("noop", |_| Ok(Noop))
            .register_cooperative("wait", |_| Ok(Wait));

        assert_eq!(registry.resolve("noop").unwrap().mode(), ExecutionMode::Blocking);
        assert_eq!(
            registry.resolve("wait").unwrap().mode(),
            ExecutionMode::Cooperative
        );
        let tags: Vec<&str> = registry.tags().map(|(t, _)| t).collect();
        assert_eq!(tags, vec!["noop", "wait"]);
    }

    #[test]
    fn test_unknown_tag() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("missing").unwrap_err();
        assert_eq!(err.to_string(), "Unknown task type: missing");
    }

    #[test]
    fn test_factory_error_surfaces() {
        let mut registry = TaskRegistry::new();
        registry.register_blocking("picky", |spec: &TaskSpec| -> Result<Noop, TaskError> {
            Err(TaskError::Validation(format!("bad spec {}", spec.name)))
        });
        let factory = registry.resolve("picky").unwrap();
        let err = factory.build(&TaskSpec::new("picky one")).err().unwrap();
        assert!(matches!(err, TaskError::Validation(_)));
    }
}
