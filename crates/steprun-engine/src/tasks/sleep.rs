//! Wait tasks.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use steprun_core::TaskSpec;

use crate::task::{
    parse_args, BlockingTask, CooperativeTask, TaskContext, TaskError, TaskOutput,
};

#[derive(Debug, Deserialize)]
struct SleepArgs {
    seconds: f64,
}

/// Awaits a timer on the worker's event loop.
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
}

impl Sleep {
    /// Build from a spec. `seconds` must be a non-negative number.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        Ok(Self {
            duration: parse_duration(spec)?,
        })
    }
}

fn parse_duration(spec: &TaskSpec) -> Result<Duration, TaskError> {
    let args: SleepArgs = parse_args(spec)?;
    Duration::try_from_secs_f64(args.seconds)
        .map_err(|e| TaskError::Validation(format!("invalid seconds {}: {e}", args.seconds)))
}

#[async_trait]
impl CooperativeTask for Sleep {
    async fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        debug!(task_id = %ctx.task_id, millis = self.duration.as_millis() as u64, "Sleeping");
        tokio::time::sleep(self.duration).await;
        Ok(TaskOutput::default().with_result("slept_ms", self.duration.as_millis() as u64))
    }
}

/// Parks the worker thread. A stop cannot interrupt it; only killing the
/// worker process does.
#[derive(Debug)]
pub struct SleepBlocking {
    duration: Duration,
}

impl SleepBlocking {
    /// Build from a spec. `seconds` must be a non-negative number.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        Ok(Self {
            duration: parse_duration(spec)?,
        })
    }
}

impl BlockingTask for SleepBlocking {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        debug!(task_id = %ctx.task_id, millis = self.duration.as_millis() as u64, "Blocking");
        std::thread::sleep(self.duration);
        Ok(TaskOutput::default().with_result("slept_ms", self.duration.as_millis() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::TaskId;

    #[test]
    fn test_negative_seconds_rejected() {
        let spec = TaskSpec::new("sleep x").with_arg("seconds", -1.0);
        assert!(matches!(Sleep::from_spec(&spec), Err(TaskError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_runs() {
        let spec = TaskSpec::new("sleep x").with_arg("seconds", 2.5);
        let mut task = Sleep::from_spec(&spec).unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "sleep x", ".");
        let out = task.run(&ctx).await.unwrap();
        assert_eq!(out.result.get("slept_ms").and_then(|v| v.as_u64()), Some(2500));
    }

    #[test]
    fn test_sleep_blocking_runs() {
        let spec = TaskSpec::new("sleep_blocking x").with_arg("seconds", 0.01);
        let mut task = SleepBlocking::from_spec(&spec).unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "sleep_blocking x", ".");
        let out = task.run(&ctx).unwrap();
        assert_eq!(out.result.get("slept_ms").and_then(|v| v.as_u64()), Some(10));
    }
}
