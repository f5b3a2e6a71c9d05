//! Manifest writers.
//!
//! The coordinator mirrors every task status change to a [`ManifestWriter`]
//! before acting on it. Writers may fail; the coordinator records the
//! failure as a diagnostic on the Step and keeps going.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use steprun_core::{
    FailureReason, RootManifest, Step, StepManifest, StepStatus, Task, TaskId, TaskManifest,
    TaskStatus,
};

/// File name of the manifest inside the work path.
pub const MANIFEST_FILENAME: &str = "manifest.json";

/// Manifest errors.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// Reading or writing the manifest file failed.
    #[error("Manifest I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The manifest could not be encoded or the existing file is invalid.
    #[error("Manifest format error: {0}")]
    Json(#[from] serde_json::Error),

    /// A task or step event arrived before the records it depends on.
    #[error("Manifest has no entry for {0}")]
    MissingEntry(String),
}

/// Sink for task and step provenance records.
///
/// `record_step_summary` is called once when a step starts and once when it
/// finishes; task records in between belong to that step.
#[async_trait]
pub trait ManifestWriter: Send {
    /// A task was created in PENDING.
    async fn record_created(&mut self, task: &Task) -> Result<(), ManifestError>;

    /// A task moved to `status`.
    async fn record_transition(
        &mut self,
        task: &Task,
        status: TaskStatus,
        failure: Option<&FailureReason>,
    ) -> Result<(), ManifestError>;

    /// Summary of the step as it stands.
    async fn record_step_summary(&mut self, step: &Step) -> Result<(), ManifestError>;
}

/// One event captured by [`MemoryManifest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ManifestRecord {
    Created {
        task_id: TaskId,
        name: String,
    },
    Transition {
        task_id: TaskId,
        status: TaskStatus,
        failure: Option<FailureReason>,
    },
    StepSummary {
        name: String,
        status: StepStatus,
    },
}

/// In-memory manifest; clones share the same record list.
#[derive(Debug, Clone, Default)]
pub struct MemoryManifest {
    records: Arc<Mutex<Vec<ManifestRecord>>>,
}

impl MemoryManifest {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All records in arrival order.
    pub async fn records(&self) -> Vec<ManifestRecord> {
        self.records.lock().await.clone()
    }

    /// Recorded statuses for one task, starting with its creation.
    pub async fn history(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        self.records
            .lock()
            .await
            .iter()
            .filter_map(|r| match r {
                ManifestRecord::Created { task_id: id, .. } if id == task_id => {
                    Some(TaskStatus::Pending)
                }
                ManifestRecord::Transition {
                    task_id: id, status, ..
                } if id == task_id => Some(*status),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl ManifestWriter for MemoryManifest {
    async fn record_created(&mut self, task: &Task) -> Result<(), ManifestError> {
        self.records.lock().await.push(ManifestRecord::Created {
            task_id: task.id.clone(),
            name: task.name.clone(),
        });
        Ok(())
    }

    async fn record_transition(
        &mut self,
        task: &Task,
        status: TaskStatus,
        failure: Option<&FailureReason>,
    ) -> Result<(), ManifestError> {
        self.records.lock().await.push(ManifestRecord::Transition {
            task_id: task.id.clone(),
            status,
            failure: failure.cloned(),
        });
        Ok(())
    }

    async fn record_step_summary(&mut self, step: &Step) -> Result<(), ManifestError> {
        self.records.lock().await.push(ManifestRecord::StepSummary {
            name: step.name.clone(),
            status: step.status(),
        });
        Ok(())
    }
}

/// Manifest persisted as `manifest.json` in the work path.
///
/// The whole document is rewritten (temp file, then rename) after every
/// record. An existing file is loaded on first use so steps run earlier
/// against the same work path are preserved.
#[derive(Debug)]
pub struct JsonManifest {
    path: PathBuf,
    root: Option<RootManifest>,
    current_step: Option<String>,
}

impl JsonManifest {
    /// Manifest stored under `work_path`.
    pub fn new(work_path: impl AsRef<Path>) -> Self {
        Self {
            path: work_path.as_ref().join(MANIFEST_FILENAME),
            root: None,
            current_step: None,
        }
    }

    /// Location of the manifest file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read a manifest file.
    pub async fn load(path: impl AsRef<Path>) -> Result<RootManifest, ManifestError> {
        let path = path.as_ref();
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ManifestError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(serde_json::from_str(&text)?)
    }

    async fn root(&mut self) -> Result<&mut RootManifest, ManifestError> {
        if self.root.is_none() {
            let root = if tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
                info!(path = %self.path.display(), "Loading existing manifest");
                Self::load(&self.path).await?
            } else {
                info!(path = %self.path.display(), "No manifest found, creating new one");
                RootManifest::default()
            };
            self.root = Some(root);
        }
        self.root
            .as_mut()
            .ok_or_else(|| ManifestError::MissingEntry("root".to_string()))
    }

    async fn step_entry(&mut self) -> Result<&mut StepManifest, ManifestError> {
        let name = self
            .current_step
            .clone()
            .ok_or_else(|| ManifestError::MissingEntry("current step".to_string()))?;
        Ok(self.root().await?.step_mut(&name))
    }

    async fn persist(&mut self) -> Result<(), ManifestError> {
        let root = self.root().await?;
        root.recalculate();
        let json = serde_json::to_string_pretty(root)?;

        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| ManifestError::Io { path, source }
        };
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(io_err(parent))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err(&tmp))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(io_err(&self.path))?;
        debug!(path = %self.path.display(), "Manifest written");
        Ok(())
    }
}

#[async_trait]
impl ManifestWriter for JsonManifest {
    async fn record_created(&mut self, task: &Task) -> Result<(), ManifestError> {
        let entry = self.step_entry().await?;
        match entry.task_mut(&task.id) {
            Some(existing) => *existing = TaskManifest::created(task),
            None => entry.tasks.push(TaskManifest::created(task)),
        }
        self.persist().await
    }

    async fn record_transition(
        &mut self,
        task: &Task,
        status: TaskStatus,
        failure: Option<&FailureReason>,
    ) -> Result<(), ManifestError> {
        let entry = self.step_entry().await?;
        let record = entry
            .task_mut(&task.id)
            .ok_or_else(|| ManifestError::MissingEntry(format!("task {}", task.name)))?;
        record.apply(task, status, failure);
        self.persist().await
    }

    async fn record_step_summary(&mut self, step: &Step) -> Result<(), ManifestError> {
        if self.current_step.as_deref() != Some(step.name.as_str()) {
            // A new step replaces whatever an earlier run left under its name.
            self.current_step = Some(step.name.clone());
            let root = self.root().await?;
            root.steps.insert(step.name.clone(), StepManifest::new(&step.name));
        }
        self.step_entry().await?.summarize(step);
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steprun_core::TaskSpec;

    fn step_with_task() -> Step {
        Step::from_specs("greet", [TaskSpec::new("hello_world a")]).unwrap()
    }

    async fn drive(writer: &mut dyn ManifestWriter, step: &mut Step) {
        writer.record_step_summary(step).await.unwrap();
        writer.record_created(&step.tasks[0]).await.unwrap();
        step.tasks[0].transition(TaskStatus::Running).unwrap();
        writer
            .record_transition(&step.tasks[0], TaskStatus::Running, None)
            .await
            .unwrap();
        step.tasks[0].transition(TaskStatus::Done).unwrap();
        writer
            .record_transition(&step.tasks[0], TaskStatus::Done, None)
            .await
            .unwrap();
        writer.record_step_summary(step).await.unwrap();
    }

    #[tokio::test]
    async fn test_memory_manifest_history() {
        let manifest = MemoryManifest::new();
        let mut writer = manifest.clone();
        let mut step = step_with_task();
        drive(&mut writer, &mut step).await;

        let history = manifest.history(&step.tasks[0].id).await;
        assert_eq!(
            history,
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done]
        );
        let records = manifest.records().await;
        assert_eq!(
            records.last(),
            Some(&ManifestRecord::StepSummary {
                name: "greet".into(),
                status: StepStatus::Done
            })
        );
    }

    #[tokio::test]
    async fn test_json_manifest_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonManifest::new(dir.path());
        let mut step = step_with_task();
        drive(&mut writer, &mut step).await;

        let root = JsonManifest::load(writer.path()).await.unwrap();
        let entry = &root.steps["greet"];
        assert_eq!(entry.status, StepStatus::Done);
        assert_eq!(root.status, StepStatus::Done);
        assert_eq!(
            entry.tasks[0].history(),
            vec![TaskStatus::Pending, TaskStatus::Running, TaskStatus::Done]
        );
        assert!(!dir.path().join("manifest.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_json_manifest_keeps_other_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut first = JsonManifest::new(dir.path());
        let mut step = step_with_task();
        drive(&mut first, &mut step).await;

        let mut second = JsonManifest::new(dir.path());
        let mut other = Step::from_specs("later", [TaskSpec::new("hello_world b")]).unwrap();
        drive(&mut second, &mut other).await;

        let root = JsonManifest::load(second.path()).await.unwrap();
        assert_eq!(root.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_location_fails() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"x").unwrap();

        let mut writer = JsonManifest::new(&blocker);
        let step = step_with_task();
        let err = writer.record_step_summary(&step).await.unwrap_err();
        assert!(matches!(err, ManifestError::Io { .. }));
    }

    #[tokio::test]
    async fn test_transition_without_creation_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = JsonManifest::new(dir.path());
        let step = step_with_task();
        writer.record_step_summary(&step).await.unwrap();
        let err = writer
            .record_transition(&step.tasks[0], TaskStatus::Running, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ManifestError::MissingEntry(_)));
    }
}
