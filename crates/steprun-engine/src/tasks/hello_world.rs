//! Simple greeting task.

use serde::Deserialize;
use tracing::info;

use steprun_core::{Artifact, TaskSpec};

use crate::task::{parse_args, BlockingTask, TaskContext, TaskError, TaskOutput};

fn default_who() -> String {
    "world".to_string()
}

#[derive(Debug, Deserialize)]
struct HelloWorldArgs {
    #[serde(default = "default_who")]
    who: String,
}

/// Logs a greeting and records who was greeted.
#[derive(Debug)]
pub struct HelloWorld {
    who: String,
}

impl HelloWorld {
    /// Build from a spec. `who` defaults to `world`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: HelloWorldArgs = parse_args(spec)?;
        Ok(Self { who: args.who })
    }
}

impl BlockingTask for HelloWorld {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        info!(task_id = %ctx.task_id, "hello {}", self.who);
        Ok(TaskOutput::default()
            .with_artifact(Artifact::new("me", self.who.clone()))
            .with_result("greeting", format!("hello {}", self.who)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::TaskId;

    #[test]
    fn test_default_who() {
        let mut task = HelloWorld::from_spec(&TaskSpec::new("hello_world x")).unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "hello_world x", ".");
        let out = task.run(&ctx).unwrap();
        assert_eq!(out.artifacts, vec![Artifact::new("me", "world")]);
        assert!(out.subtasks.is_empty());
    }

    #[test]
    fn test_wrong_type_is_rejected() {
        let spec = TaskSpec::new("hello_world x").with_arg("who", 3);
        assert!(matches!(
            HelloWorld::from_spec(&spec),
            Err(TaskError::Validation(_))
        ));
    }
}
