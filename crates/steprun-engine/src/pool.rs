//! Worker pool: owns the worker processes for one run.
//!
//! Each worker is a child process speaking the line protocol over its
//! stdin/stdout. Per worker, a reader task turns stdout into
//! [`PoolEvent`]s on a shared channel and a second task forwards stderr to
//! the log. The pool is the only place processes are started or killed.

use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use steprun_core::{TaskId, WorkerId};

use crate::config::{RunConfig, MIN_POOL_SIZE};
use crate::protocol::{
    CoordinatorMessage, MessageReader, MessageWriter, ProtocolError, TaskAssignment, WorkerMessage,
};

/// Pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Fewer workers requested than the pool needs.
    #[error("Pool needs at least {MIN_POOL_SIZE} workers, got {0}")]
    TooSmall(usize),

    /// A worker process could not be started.
    #[error("Failed to spawn worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A spawned worker has no pipe where one was requested.
    #[error("Worker {0} is missing its {1} pipe")]
    MissingPipe(WorkerId, &'static str),

    /// No worker with this id belongs to the pool.
    #[error("Unknown worker: {0}")]
    UnknownWorker(WorkerId),

    /// Talking to a worker failed.
    #[error("Protocol error with worker {worker}: {source}")]
    Protocol {
        worker: WorkerId,
        #[source]
        source: ProtocolError,
    },
}

/// Something observed on a worker's stdout.
#[derive(Debug)]
pub enum PoolEvent {
    /// A decoded protocol message.
    Message {
        worker: WorkerId,
        message: WorkerMessage,
    },
    /// A line that was not a valid message.
    Malformed { worker: WorkerId, error: String },
    /// stdout reached EOF; the process is exiting.
    Closed { worker: WorkerId },
}

/// How a reaped worker ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitKind {
    /// The pool asked it to stop or killed it.
    Expected { task: Option<TaskId> },
    /// It died on its own.
    Crashed { status: String, task: Option<TaskId> },
}

struct WorkerHandle {
    id: WorkerId,
    pid: Option<u32>,
    child: Child,
    stdin: Option<MessageWriter<ChildStdin>>,
    assignment: Option<TaskId>,
    stop_requested: bool,
    killed: bool,
    reaped: bool,
}

impl WorkerHandle {
    async fn send(&mut self, message: &CoordinatorMessage) -> Result<(), PoolError> {
        let id = self.id.clone();
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PoolError::MissingPipe(id.clone(), "stdin"))?;
        stdin
            .send(message)
            .await
            .map_err(|source| PoolError::Protocol { worker: id, source })
    }

    fn kill(&mut self) {
        if self.reaped || self.killed {
            return;
        }
        match self.child.start_kill() {
            Ok(()) => {
                warn!(worker_id = %self.id, pid = ?self.pid, "Killing worker");
                self.killed = true;
            }
            // Already exited; reaping will collect it.
            Err(e) => debug!(worker_id = %self.id, error = %e, "Kill failed"),
        }
    }
}

/// The worker processes of one run.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
    stop_timeout: Duration,
}

impl WorkerPool {
    /// Launch `config.pool_size` workers. Their stdout is decoded onto
    /// `events`. If any launch fails, the workers already started are killed.
    pub fn spawn(config: &RunConfig, events: mpsc::Sender<PoolEvent>) -> Result<Self, PoolError> {
        if config.pool_size < MIN_POOL_SIZE {
            return Err(PoolError::TooSmall(config.pool_size));
        }

        let mut pool = Self {
            workers: Vec::with_capacity(config.pool_size),
            stop_timeout: config.stop_timeout,
        };
        for slot in 0..config.pool_size {
            match spawn_worker(config, WorkerId::for_slot(slot), events.clone()) {
                Ok(handle) => pool.workers.push(handle),
                Err(e) => {
                    error!(error = %e, "Failed to start worker pool");
                    pool.kill_all();
                    return Err(e);
                }
            }
        }
        info!(pool_size = config.pool_size, program = %config.worker_program.display(), "Worker pool started");
        Ok(pool)
    }

    fn handle(&mut self, worker: &WorkerId) -> Result<&mut WorkerHandle, PoolError> {
        self.workers
            .iter_mut()
            .find(|w| &w.id == worker)
            .ok_or_else(|| PoolError::UnknownWorker(worker.clone()))
    }

    /// Ids of every worker, in slot order.
    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.workers.iter().map(|w| w.id.clone()).collect()
    }

    /// Task currently assigned to `worker`.
    pub fn assignment(&self, worker: &WorkerId) -> Option<&TaskId> {
        self.workers
            .iter()
            .find(|w| &w.id == worker)
            .and_then(|w| w.assignment.as_ref())
    }

    /// Hand `task` to `worker`. The assignment is recorded before the write,
    /// so a worker that dies mid-send is still charged with the task.
    pub async fn assign(
        &mut self,
        worker: &WorkerId,
        task: TaskAssignment,
    ) -> Result<(), PoolError> {
        let handle = self.handle(worker)?;
        handle.assignment = Some(task.task_id.clone());
        handle.send(&CoordinatorMessage::Assign { task }).await
    }

    /// Tell `worker` to pull again later.
    pub async fn idle(&mut self, worker: &WorkerId, retry_after: Duration) -> Result<(), PoolError> {
        let retry_after_ms = retry_after.as_millis() as u64;
        self.handle(worker)?
            .send(&CoordinatorMessage::Idle { retry_after_ms })
            .await
    }

    /// Tell `worker` to leave its pull loop.
    pub async fn stop(&mut self, worker: &WorkerId) -> Result<(), PoolError> {
        let handle = self.handle(worker)?;
        if handle.reaped {
            return Ok(());
        }
        handle.stop_requested = true;
        handle.send(&CoordinatorMessage::Stop).await
    }

    /// Clear and return `worker`'s assignment.
    pub fn release(&mut self, worker: &WorkerId) -> Option<TaskId> {
        self.handle(worker).ok().and_then(|w| w.assignment.take())
    }

    /// Collect an exiting worker. Waits up to the stop timeout, then kills.
    pub async fn reap(&mut self, worker: &WorkerId) -> Result<ExitKind, PoolError> {
        let stop_timeout = self.stop_timeout;
        let handle = self.handle(worker)?;
        // Closing stdin lets a worker blocked on a pull see EOF.
        handle.stdin = None;

        let status = match tokio::time::timeout(stop_timeout, handle.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(worker_id = %handle.id, error = %e, "Failed to wait for worker");
                None
            }
            Err(_) => {
                warn!(worker_id = %handle.id, timeout = ?stop_timeout, "Worker did not exit in time");
                handle.kill();
                handle.child.wait().await.ok()
            }
        };
        handle.reaped = true;

        let task = handle.assignment.take();
        let kind = if handle.stop_requested || handle.killed {
            ExitKind::Expected { task }
        } else {
            ExitKind::Crashed {
                status: describe(status),
                task,
            }
        };
        info!(worker_id = %handle.id, status = %describe(status), exit = ?kind, "Worker exited");
        Ok(kind)
    }

    /// Send `stop` to every live worker. Write failures are logged; a dead
    /// worker shows up as a closed event anyway.
    pub async fn request_stop_all(&mut self) {
        for handle in self.workers.iter_mut().filter(|w| !w.reaped) {
            handle.stop_requested = true;
            if let Err(e) = handle.send(&CoordinatorMessage::Stop).await {
                debug!(worker_id = %handle.id, error = %e, "Could not deliver stop");
            }
        }
    }

    /// Force-terminate every live worker.
    pub fn kill_all(&mut self) {
        for handle in self.workers.iter_mut() {
            handle.kill();
        }
    }

    /// Number of workers not yet reaped.
    pub fn live(&self) -> usize {
        self.workers.iter().filter(|w| !w.reaped).count()
    }

    /// True once every worker has been reaped.
    pub fn is_drained(&self) -> bool {
        self.live() == 0
    }

    /// Stop every live worker and reap them all.
    pub async fn shutdown(&mut self) {
        self.request_stop_all().await;
        for id in self.worker_ids() {
            let reaped = self.handle(&id).map(|w| w.reaped).unwrap_or(true);
            if !reaped {
                if let Err(e) = self.reap(&id).await {
                    warn!(worker_id = %id, error = %e, "Failed to reap worker");
                }
            }
        }
        info!("Worker pool shut down");
    }
}

fn describe(status: Option<ExitStatus>) -> String {
    match status {
        Some(status) => status.to_string(),
        None => "unknown status".to_string(),
    }
}

fn spawn_worker(
    config: &RunConfig,
    id: WorkerId,
    events: mpsc::Sender<PoolEvent>,
) -> Result<WorkerHandle, PoolError> {
    let mut cmd = Command::new(&config.worker_program);
    cmd.arg("--worker-id")
        .arg(id.as_str())
        .arg("--work-path")
        .arg(&config.work_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(worker_id = %id, "Full command: {:?}", cmd);

    let mut child = cmd.spawn().map_err(|source| PoolError::Spawn {
        program: config.worker_program.display().to_string(),
        source,
    })?;
    let pid = child.id();

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| PoolError::MissingPipe(id.clone(), "stdin"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| PoolError::MissingPipe(id.clone(), "stdout"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| PoolError::MissingPipe(id.clone(), "stderr"))?;

    // Spawn stderr reader for logging
    let worker = id.clone();
    tokio::spawn(async move {
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim_end();
                    if !trimmed.is_empty() {
                        debug!(worker_id = %worker, "{}", trimmed);
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker, error = %e, "Error reading worker stderr");
                    break;
                }
            }
        }
    });

    // Spawn stdout reader that forwards protocol messages
    let worker = id.clone();
    tokio::spawn(async move {
        let mut reader = MessageReader::new(stdout);
        loop {
            let event = match reader.next::<WorkerMessage>().await {
                Ok(Some(message)) => PoolEvent::Message {
                    worker: worker.clone(),
                    message,
                },
                Ok(None) => break,
                Err(ProtocolError::Json { source, preview }) => {
                    warn!(worker_id = %worker, error = %source, preview = %preview, "Malformed message from worker");
                    PoolEvent::Malformed {
                        worker: worker.clone(),
                        error: source.to_string(),
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker, error = %e, "Error reading worker stdout");
                    break;
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
        debug!(worker_id = %worker, "Worker stdout closed (EOF)");
        let _ = events.send(PoolEvent::Closed { worker }).await;
    });

    info!(worker_id = %id, pid = ?pid, "Worker spawned");
    Ok(WorkerHandle {
        id,
        pid,
        child,
        stdin: Some(MessageWriter::new(stdin)),
        assignment: None,
        stop_requested: false,
        killed: false,
        reaped: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_of_one_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let config = RunConfig::default().with_pool_size(1);
        let err = WorkerPool::spawn(&config, tx).err().unwrap();
        assert!(matches!(err, PoolError::TooSmall(1)));
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let (tx, _rx) = mpsc::channel(1);
        let config = RunConfig::new("/nonexistent/steprun-worker-missing");
        let err = WorkerPool::spawn(&config, tx).err().unwrap();
        assert!(matches!(err, PoolError::Spawn { .. }));
    }

    #[test]
    fn test_describe_unknown_status() {
        assert_eq!(describe(None), "unknown status");
    }
}
