//! Worker pull loop.
//!
//! A worker process asks the coordinator for work, executes exactly one
//! task at a time and reports the outcome. Blocking tasks run by direct
//! invocation and cannot be interrupted; cooperative tasks run on the
//! process's event loop and are abandoned at their next await point when a
//! stop arrives.

use std::path::PathBuf;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use steprun_core::{FailureReason, WorkerId};

use crate::protocol::{
    CoordinatorMessage, MessageReader, MessageWriter, ProtocolError, TaskAssignment, TaskOutcome,
    WorkerMessage,
};
use crate::registry::TaskRegistry;
use crate::task::{BlockingTask, CooperativeTask, TaskContext, TaskLogic};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Pool slot this worker occupies.
    pub worker_id: WorkerId,

    /// Directory relative task locations resolve against.
    pub work_path: PathBuf,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: WorkerId::for_slot(0),
            work_path: PathBuf::from("."),
        }
    }
}

/// How executing one assignment ended.
#[derive(Debug)]
pub enum Execution {
    /// The task ran to an outcome that must be reported.
    Finished(TaskOutcome),
    /// A stop arrived first; the task was abandoned.
    Stopped,
}

/// Executes tasks for one pool slot.
pub struct Worker {
    config: WorkerConfig,
    registry: TaskRegistry,
}

impl Worker {
    /// Create a new Worker.
    pub fn new(config: WorkerConfig, registry: TaskRegistry) -> Self {
        Self { config, registry }
    }

    /// Run the pull loop over the given pipes until told to stop or the
    /// coordinator goes away.
    pub async fn run<R, W>(&self, input: R, output: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin,
    {
        let mut writer = MessageWriter::new(output);
        let mut inbox = spawn_inbox(input);
        let worker_id = &self.config.worker_id;

        writer
            .send(&WorkerMessage::Ready {
                worker_id: worker_id.clone(),
                pid: std::process::id(),
            })
            .await?;
        info!(worker_id = %worker_id, "Worker started");

        loop {
            writer.send(&WorkerMessage::Pull).await?;

            let Some(message) = inbox.recv().await else {
                info!(worker_id = %worker_id, "Coordinator closed the connection");
                break;
            };

            match message {
                CoordinatorMessage::Assign { task } => {
                    info!(worker_id = %worker_id, task_id = %task.task_id, name = %task.name, "Executing task");
                    match self.execute(&task, &mut inbox).await {
                        Execution::Finished(outcome) => {
                            debug!(worker_id = %worker_id, task_id = %task.task_id, "Reporting outcome");
                            writer
                                .send(&WorkerMessage::Report {
                                    task_id: task.task_id.clone(),
                                    outcome,
                                })
                                .await?;
                        }
                        Execution::Stopped => {
                            warn!(worker_id = %worker_id, task_id = %task.task_id, "Stopped mid-task");
                            break;
                        }
                    }
                }
                CoordinatorMessage::Idle { retry_after_ms } => {
                    let delay = tokio::time::sleep(Duration::from_millis(retry_after_ms));
                    tokio::select! {
                        _ = delay => {}
                        _ = wait_for_stop(&mut inbox) => break,
                    }
                }
                CoordinatorMessage::Stop => {
                    info!(worker_id = %worker_id, "Stop requested");
                    break;
                }
            }
        }

        info!(worker_id = %worker_id, "Worker shutting down");
        Ok(())
    }

    /// Execute one assignment, watching `inbox` for a stop while a
    /// cooperative task is suspended.
    pub async fn execute(
        &self,
        assignment: &TaskAssignment,
        inbox: &mut mpsc::Receiver<CoordinatorMessage>,
    ) -> Execution {
        let logic = match self.build(assignment) {
            Ok(logic) => logic,
            Err(reason) => return Execution::Finished(TaskOutcome::Failed { reason }),
        };
        let ctx = TaskContext::new(
            assignment.task_id.clone(),
            assignment.name.clone(),
            self.config.work_path.clone(),
        );

        debug!(task_id = %assignment.task_id, mode = ?logic.mode(), "Executing task");
        match logic {
            TaskLogic::Blocking(mut task) => Execution::Finished(run_blocking(task.as_mut(), &ctx)),
            TaskLogic::Cooperative(mut task) => {
                tokio::select! {
                    outcome = run_cooperative(task.as_mut(), &ctx) => Execution::Finished(outcome),
                    _ = wait_for_stop(inbox) => Execution::Stopped,
                }
            }
        }
    }

    fn build(&self, assignment: &TaskAssignment) -> Result<TaskLogic, FailureReason> {
        let factory = self
            .registry
            .resolve(&assignment.tag)
            .map_err(|e| FailureReason::validation(e.to_string()))?;
        factory.build(&assignment.spec()).map_err(|e| {
            warn!(task_id = %assignment.task_id, error = %e, "Could not build task");
            e.into_reason()
        })
    }
}

fn run_blocking(task: &mut dyn BlockingTask, ctx: &TaskContext) -> TaskOutcome {
    let output = match task.run(ctx) {
        Ok(output) => output,
        Err(e) => return TaskOutcome::Failed { reason: e.into_reason() },
    };
    if let Err(e) = task.validate(ctx) {
        return TaskOutcome::Failed {
            reason: FailureReason::validation(e.to_string()),
        };
    }
    TaskOutcome::from_output(output)
}

async fn run_cooperative(task: &mut dyn CooperativeTask, ctx: &TaskContext) -> TaskOutcome {
    let output = match task.run(ctx).await {
        Ok(output) => output,
        Err(e) => return TaskOutcome::Failed { reason: e.into_reason() },
    };
    if let Err(e) = task.validate(ctx).await {
        return TaskOutcome::Failed {
            reason: FailureReason::validation(e.to_string()),
        };
    }
    TaskOutcome::from_output(output)
}

/// Resolves once a stop arrives or the inbox closes. Other messages are
/// not expected while busy and are dropped.
async fn wait_for_stop(inbox: &mut mpsc::Receiver<CoordinatorMessage>) {
    loop {
        match inbox.recv().await {
            Some(CoordinatorMessage::Stop) | None => return,
            Some(other) => warn!(message = ?other, "Ignoring message while busy"),
        }
    }
}

/// Spawn the stdin reader, forwarding decoded messages.
fn spawn_inbox<R>(input: R) -> mpsc::Receiver<CoordinatorMessage>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(16);
    tokio::spawn(async move {
        let mut reader = MessageReader::new(input);
        loop {
            match reader.next::<CoordinatorMessage>().await {
                Ok(Some(message)) => {
                    if tx.send(message).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Bad message from coordinator");
                }
            }
        }
    });
    rx
}
