//! File copy tasks.

use std::path::Path;

use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use steprun_core::{Artifact, TaskSpec};

use crate::storage::StorageError;
use crate::task::{parse_args, BlockingTask, CooperativeTask, TaskContext, TaskError, TaskOutput};

#[derive(Debug, Deserialize)]
struct CopyArgs {
    source: String,
    destination: String,
}

/// Copies one file, then checks the copy exists and matches in size.
#[derive(Debug)]
pub struct CopyFile {
    source: String,
    destination: String,
}

impl CopyFile {
    /// Build from a spec with `source` and `destination`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: CopyArgs = parse_args(spec)?;
        Ok(Self {
            source: args.source,
            destination: args.destination,
        })
    }
}

impl BlockingTask for CopyFile {
    fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        info!(task_id = %ctx.task_id, source = %self.source, destination = %self.destination, "Copying file");
        let bytes = ctx.storage().copy(&self.source, &self.destination)?;
        Ok(TaskOutput::default()
            .with_artifact(Artifact::new(self.source.clone(), self.destination.clone()))
            .with_result("bytes", bytes))
    }

    fn validate(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        let storage = ctx.storage();
        if !storage.exists(&self.destination)? {
            return Err(TaskError::Validation(format!(
                "file does not exist: {}",
                self.destination
            )));
        }
        let source_size = storage.size(&self.source).map_err(|e| {
            TaskError::Validation(format!("could not stat {}: {e}", self.source))
        })?;
        let destination_size = storage.size(&self.destination).map_err(|e| {
            TaskError::Validation(format!("could not stat {}: {e}", self.destination))
        })?;
        if source_size != destination_size {
            return Err(TaskError::Validation(format!(
                "file size mismatch: {} ({source_size}) != {} ({destination_size})",
                self.source, self.destination
            )));
        }
        Ok(())
    }
}

fn default_concurrency() -> usize {
    10
}

#[derive(Debug, Deserialize)]
struct CopyManyArgs {
    sources: Vec<String>,
    destination: String,
    #[serde(default = "default_concurrency")]
    max_concurrency: usize,
}

/// Copies many files into one directory, several at a time.
#[derive(Debug)]
pub struct CopyMany {
    sources: Vec<String>,
    destination: String,
    max_concurrency: usize,
}

impl CopyMany {
    /// Build from a spec with `sources`, `destination` and optional
    /// `max_concurrency`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: CopyManyArgs = parse_args(spec)?;
        if args.max_concurrency == 0 {
            return Err(TaskError::Validation(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            sources: args.sources,
            destination: args.destination,
            max_concurrency: args.max_concurrency,
        })
    }

    fn destination_for(&self, source: &str) -> Result<String, TaskError> {
        let name = Path::new(source)
            .file_name()
            .ok_or_else(|| TaskError::Validation(format!("source has no file name: {source}")))?;
        Ok(format!(
            "{}/{}",
            self.destination.trim_end_matches('/'),
            name.to_string_lossy()
        ))
    }
}

#[async_trait]
impl CooperativeTask for CopyMany {
    async fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let storage = ctx.async_storage();
        let mut jobs = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            jobs.push((source.clone(), self.destination_for(source)?));
        }

        let artifacts: Vec<Artifact> = stream::iter(jobs)
            .map(|(source, destination)| async move {
                storage.copy(&source, &destination).await.map_err(|e| {
                    warn!(source = %source, error = %e, "Copy failed");
                    e
                })?;
                info!(source = %source, destination = %destination, "Copied file");
                Ok::<_, StorageError>(Artifact::new(source, destination))
            })
            .buffer_unordered(self.max_concurrency)
            .try_collect()
            .await?;

        let mut output = TaskOutput::default().with_result("copied", artifacts.len() as u64);
        output.artifacts = artifacts;
        Ok(output)
    }

    async fn validate(&mut self, ctx: &TaskContext) -> Result<(), TaskError> {
        for source in &self.sources {
            let destination = self.destination_for(source)?;
            if !ctx.async_storage().exists(&destination).await? {
                return Err(TaskError::Validation(format!(
                    "file does not exist: {destination}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use steprun_core::{FailureKind, TaskId};

    fn ctx(dir: &Path) -> TaskContext {
        TaskContext::new(TaskId::generate(), "copy test", dir)
    }

    #[test]
    fn test_copy_and_validate() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.storage().write("in/a.txt", b"abc").unwrap();

        let spec = TaskSpec::new("copy a")
            .with_arg("source", "in/a.txt")
            .with_arg("destination", "out/a.txt");
        let mut task = CopyFile::from_spec(&spec).unwrap();
        let out = task.run(&ctx).unwrap();
        assert_eq!(out.artifacts, vec![Artifact::new("in/a.txt", "out/a.txt")]);
        task.validate(&ctx).unwrap();
    }

    #[test]
    fn test_copy_missing_source_is_execution_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        let spec = TaskSpec::new("copy a")
            .with_arg("source", "nope.txt")
            .with_arg("destination", "out/a.txt");
        let mut task = CopyFile::from_spec(&spec).unwrap();
        let err = task.run(&ctx).unwrap_err();
        assert_eq!(err.kind(), FailureKind::TaskExecution);
    }

    #[test]
    fn test_size_mismatch_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.storage().write("a.txt", b"abc").unwrap();
        ctx.storage().write("b.txt", b"abcdef").unwrap();
        let spec = TaskSpec::new("copy a")
            .with_arg("source", "a.txt")
            .with_arg("destination", "b.txt");
        let mut task = CopyFile::from_spec(&spec).unwrap();
        let err = task.validate(&ctx).unwrap_err();
        assert_eq!(err.kind(), FailureKind::TaskValidation);
        assert!(err.to_string().contains("size mismatch"));
    }

    #[tokio::test]
    async fn test_copy_many() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.storage().write("src/one.txt", b"1").unwrap();
        ctx.storage().write("src/two.txt", b"22").unwrap();

        let spec = TaskSpec::new("copy_many all")
            .with_arg("sources", vec!["src/one.txt", "src/two.txt"])
            .with_arg("destination", "dst/")
            .with_arg("max_concurrency", 1);
        let mut task = CopyMany::from_spec(&spec).unwrap();
        let out = task.run(&ctx).await.unwrap();
        assert_eq!(out.artifacts.len(), 2);
        task.validate(&ctx).await.unwrap();
        assert_eq!(ctx.storage().size("dst/two.txt").unwrap(), 2);
    }
}
