//! Tasks that end badly on purpose, for exercising failure handling.

use serde::Deserialize;
use tracing::{error, warn};

use steprun_core::TaskSpec;

use crate::task::{parse_args, BlockingTask, TaskContext, TaskError, TaskOutput};

fn default_message() -> String {
    "task failed on purpose".to_string()
}

#[derive(Debug, Deserialize)]
struct FailArgs {
    #[serde(default = "default_message")]
    message: String,
}

/// Always fails with a task execution error.
#[derive(Debug)]
pub struct Fail {
    message: String,
}

impl Fail {
    /// Build from a spec. `message` is optional.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: FailArgs = parse_args(spec)?;
        Ok(Self {
            message: args.message,
        })
    }
}

impl BlockingTask for Fail {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        warn!(task_id = %ctx.task_id, message = %self.message, "Failing on purpose");
        Err(TaskError::Execution(self.message.clone()))
    }
}

fn default_code() -> i32 {
    1
}

#[derive(Debug, Deserialize)]
struct ExitArgs {
    #[serde(default = "default_code")]
    code: i32,
}

/// Terminates the worker process without reporting.
#[derive(Debug)]
pub struct Exit {
    code: i32,
}

impl Exit {
    /// Build from a spec. `code` defaults to 1.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: ExitArgs = parse_args(spec)?;
        Ok(Self { code: args.code })
    }
}

impl BlockingTask for Exit {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        error!(task_id = %ctx.task_id, code = self.code, "Exiting worker process");
        std::process::exit(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::{FailureKind, TaskId};

    #[test]
    fn test_fail_reports_message() {
        let spec = TaskSpec::new("fail x").with_arg("message", "boom");
        let mut task = Fail::from_spec(&spec).unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "fail x", ".");
        let err = task.run(&ctx).unwrap_err();
        assert_eq!(err.kind(), FailureKind::TaskExecution);
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_exit_code_default() {
        let task = Exit::from_spec(&TaskSpec::new("exit now")).unwrap();
        assert_eq!(task.code, 1);
    }
}
