//! Pick the most recently modified file under a location.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::info;

use steprun_core::TaskSpec;

use crate::storage::{split_glob, StorageError};
use crate::task::{parse_args, CooperativeTask, TaskContext, TaskError, TaskOutput};

#[derive(Debug, Deserialize)]
struct FindLatestArgs {
    source: String,
}

/// Finds the last-modified file among those matching `source`.
///
/// `source` is a location, optionally ending in a glob (`in/exports/*.csv`).
/// The chosen location is returned in the result under `latest`.
#[derive(Debug)]
pub struct FindLatest {
    source: String,
}

impl FindLatest {
    /// Build from a spec with `source`.
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, TaskError> {
        let args: FindLatestArgs = parse_args(spec)?;
        if args.source.trim().is_empty() {
            return Err(TaskError::Validation("source must not be empty".to_string()));
        }
        Ok(Self {
            source: args.source,
        })
    }

    async fn candidates(&self, ctx: &TaskContext) -> Result<Vec<String>, StorageError> {
        let storage = ctx.async_storage();
        let (prefix, pattern) = split_glob(&self.source);
        if !pattern.is_empty() {
            return storage.list(prefix, pattern).await;
        }
        if storage.exists(prefix).await? {
            Ok(vec![prefix.to_string()])
        } else {
            Ok(Vec::new())
        }
    }
}

#[async_trait]
impl CooperativeTask for FindLatest {
    async fn run(&mut self, ctx: &TaskContext) -> Result<TaskOutput, TaskError> {
        let mut latest: Option<(String, DateTime<Utc>)> = None;
        for location in self.candidates(ctx).await? {
            let modified = ctx.async_storage().modified(&location).await?;
            if latest.as_ref().map_or(true, |(_, best)| modified > *best) {
                latest = Some((location, modified));
            }
        }

        let Some((location, modified)) = latest else {
            return Err(StorageError::NotFound(format!(
                "no files found matching {}",
                self.source
            ))
            .into());
        };
        info!(task_id = %ctx.task_id, latest = %location, "Found latest file");
        Ok(TaskOutput::default()
            .with_result("latest", location)
            .with_result("modified_at", modified.to_rfc3339()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use std::time::{Duration, SystemTime};
    use steprun_core::{FailureKind, TaskId};

    fn age(path: &std::path::Path, seconds: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(seconds))
            .unwrap();
    }

    #[tokio::test]
    async fn test_picks_most_recent_match() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "find_latest export", dir.path());
        for name in ["exports/2024.csv", "exports/2025.csv", "exports/notes.txt"] {
            ctx.storage().write(name, b"x").unwrap();
        }
        age(&dir.path().join("exports/2024.csv"), 120);
        age(&dir.path().join("exports/2025.csv"), 60);

        let spec = TaskSpec::new("find_latest export").with_arg("source", "exports/*.csv");
        let mut task = FindLatest::from_spec(&spec).unwrap();
        let out = task.run(&ctx).await.unwrap();
        assert_eq!(
            out.result.get("latest").and_then(|v| v.as_str()),
            Some("exports/2025.csv")
        );
    }

    #[tokio::test]
    async fn test_plain_location() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "find_latest one", dir.path());
        ctx.storage().write("one.txt", b"x").unwrap();

        let spec = TaskSpec::new("find_latest one").with_arg("source", "one.txt");
        let out = FindLatest::from_spec(&spec).unwrap().run(&ctx).await.unwrap();
        assert_eq!(out.result.get("latest").and_then(|v| v.as_str()), Some("one.txt"));
    }

    #[tokio::test]
    async fn test_no_match_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = TaskContext::new(TaskId::generate(), "find_latest none", dir.path());
        ctx.storage().write("exports/a.txt", b"x").unwrap();

        let spec = TaskSpec::new("find_latest none").with_arg("source", "exports/*.csv");
        let err = FindLatest::from_spec(&spec)
            .unwrap()
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::Storage(StorageError::NotFound(_))));
        assert_eq!(err.kind(), FailureKind::TaskExecution);
    }
}
