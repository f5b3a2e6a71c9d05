//! Coordinator/worker wire protocol.
//!
//! Newline-delimited JSON. The coordinator writes [`CoordinatorMessage`]s to
//! a worker's stdin and reads [`WorkerMessage`]s from its stdout; stderr is
//! left to the worker's logs.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use steprun_core::{FailureReason, Task, TaskId, TaskSpec, WorkerId};

use crate::task::TaskOutput;

/// Protocol errors.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Reading or writing the pipe failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was not a valid message.
    #[error("Malformed message: {source} (line: {preview})")]
    Json {
        #[source]
        source: serde_json::Error,
        preview: String,
    },

    /// Encoding an outgoing message failed.
    #[error("Encoding error: {0}")]
    Encode(serde_json::Error),
}

/// A task handed to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: TaskId,
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

impl TaskAssignment {
    /// Spec to build the task logic from.
    pub fn spec(&self) -> TaskSpec {
        TaskSpec {
            name: self.name.clone(),
            args: self.args.clone(),
        }
    }
}

impl From<&Task> for TaskAssignment {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            name: task.name.clone(),
            tag: task.tag.clone(),
            args: task.args.clone(),
        }
    }
}

/// Result of executing one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Logic succeeded and spawned nothing.
    Done { output: TaskOutput },
    /// Logic succeeded and spawned subtasks.
    Spawned { output: TaskOutput },
    /// Logic or validation failed.
    Failed { reason: FailureReason },
}

impl TaskOutcome {
    /// Classify a successful run by whether it spawned subtasks.
    pub fn from_output(output: TaskOutput) -> Self {
        if output.subtasks.is_empty() {
            Self::Done { output }
        } else {
            Self::Spawned { output }
        }
    }
}

/// Messages from a worker to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Sent once at startup.
    Ready { worker_id: WorkerId, pid: u32 },
    /// Request the next task.
    Pull,
    /// Outcome of the task last assigned.
    Report {
        task_id: TaskId,
        outcome: TaskOutcome,
    },
}

/// Messages from the coordinator to a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Execute this task, then report.
    Assign { task: TaskAssignment },
    /// Nothing is ready; pull again after the delay.
    Idle { retry_after_ms: u64 },
    /// Exit the pull loop.
    Stop,
}

/// Writes one JSON message per line.
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    /// Wrap a writable pipe.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Encode, write and flush one message.
    pub async fn send<T: Serialize>(&mut self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message).map_err(ProtocolError::Encode)?;
        trace!("Sending: {}", json);
        self.inner.write_all(json.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reads one JSON message per line.
pub struct MessageReader<R> {
    inner: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    /// Wrap a readable pipe.
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Next message, or `None` at EOF. Blank lines are skipped; a
    /// malformed line is consumed and reported as an error.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        loop {
            self.line.clear();
            if self.inner.read_line(&mut self.line).await? == 0 {
                return Ok(None);
            }
            let trimmed = self.line.trim();
            if trimmed.is_empty() {
                continue;
            }
            trace!("Received: {}", trimmed);
            return serde_json::from_str(trimmed)
                .map(Some)
                .map_err(|source| ProtocolError::Json {
                    source,
                    // Log first 200 chars for debugging
                    preview: trimmed.chars().take(200).collect(),
                });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::FailureKind;

    #[test]
    fn test_wire_format() {
        let json = serde_json::to_string(&WorkerMessage::Pull).unwrap();
        assert_eq!(json, r#"{"type":"pull"}"#);

        let json = serde_json::to_string(&CoordinatorMessage::Idle { retry_after_ms: 50 }).unwrap();
        assert_eq!(json, r#"{"type":"idle","retry_after_ms":50}"#);

        let report: WorkerMessage = serde_json::from_str(
            r#"{"type":"report","task_id":"t1","outcome":{"status":"failed","reason":{"kind":"task_execution","message":"boom"}}}"#,
        )
        .unwrap();
        match report {
            WorkerMessage::Report {
                task_id,
                outcome: TaskOutcome::Failed { reason },
            } => {
                assert_eq!(task_id.as_str(), "t1");
                assert_eq!(reason.kind, FailureKind::TaskExecution);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn test_outcome_from_output() {
        assert!(matches!(
            TaskOutcome::from_output(TaskOutput::default()),
            TaskOutcome::Done { .. }
        ));
        let output = TaskOutput::default().with_subtask(TaskSpec::new("hello_world a"));
        assert!(matches!(
            TaskOutcome::from_output(output),
            TaskOutcome::Spawned { .. }
        ));
    }

    #[tokio::test]
    async fn test_reader_skips_blank_and_reports_garbage() {
        let input: &[u8] = b"\n{\"type\":\"pull\"}\nnot json\n{\"type\":\"stop\"}\n";
        let mut reader = MessageReader::new(input);

        let first: Option<WorkerMessage> = reader.next().await.unwrap();
        assert_eq!(first, Some(WorkerMessage::Pull));

        let bad = reader.next::<CoordinatorMessage>().await;
        assert!(matches!(bad, Err(ProtocolError::Json { .. })));

        let stop: Option<CoordinatorMessage> = reader.next().await.unwrap();
        assert_eq!(stop, Some(CoordinatorMessage::Stop));

        let eof: Option<CoordinatorMessage> = reader.next().await.unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_writer_roundtrip() {
        let mut buf = Vec::new();
        {
            let mut writer = MessageWriter::new(&mut buf);
            writer.send(&WorkerMessage::Pull).await.unwrap();
            writer
                .send(&WorkerMessage::Ready {
                    worker_id: WorkerId::for_slot(0),
                    pid: 42,
                })
                .await
                .unwrap();
        }
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
    }
}
