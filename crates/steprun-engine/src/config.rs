//! Run and pipeline configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use steprun_core::{Step, TaskSpec};

/// Fewest workers a pool may run with: one executing, one left for halt
/// signalling.
pub const MIN_POOL_SIZE: usize = 2;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The pipeline file could not be read.
    #[error("Failed to read '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pipeline file is not valid YAML for a pipeline.
    #[error("Failed to parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The requested step is not declared.
    #[error("Unknown step '{0}'")]
    UnknownStep(String),

    /// A value is out of range or malformed.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for one `Coordinator::run`.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Number of worker processes.
    pub pool_size: usize,

    /// Executable launched for each worker. Its task registry must cover
    /// every type the coordinator's registry accepts.
    pub worker_program: PathBuf,

    /// Directory tasks resolve relative locations against.
    pub work_path: PathBuf,

    /// How long an idle worker waits before pulling again.
    pub idle_retry: Duration,

    /// How long a stopped worker gets to exit before it is killed.
    pub stop_timeout: Duration,

    /// How long workers get to wind down after a halt before they are killed.
    pub halt_grace: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            pool_size: MIN_POOL_SIZE,
            worker_program: PathBuf::from("steprun-worker"),
            work_path: PathBuf::from("."),
            idle_retry: Duration::from_millis(50),
            stop_timeout: Duration::from_secs(5),
            halt_grace: Duration::from_millis(500),
        }
    }
}

impl RunConfig {
    /// Config launching `worker_program`, defaults elsewhere.
    pub fn new(worker_program: impl Into<PathBuf>) -> Self {
        Self {
            worker_program: worker_program.into(),
            ..Default::default()
        }
    }

    /// Builder method to set the pool size.
    pub fn with_pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    /// Builder method to set the work path.
    pub fn with_work_path(mut self, work_path: impl Into<PathBuf>) -> Self {
        self.work_path = work_path.into();
        self
    }

    /// Builder method to set the halt grace period.
    pub fn with_halt_grace(mut self, halt_grace: Duration) -> Self {
        self.halt_grace = halt_grace;
        self
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size < MIN_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "pool_size must be at least {MIN_POOL_SIZE}, got {}",
                self.pool_size
            )));
        }
        if self.worker_program.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("worker_program is empty".into()));
        }
        if self.idle_retry.is_zero() {
            return Err(ConfigError::Invalid("idle_retry must be positive".into()));
        }
        Ok(())
    }
}

/// A pipeline file: named steps, each a list of task specs.
///
/// ```yaml
/// work_path: ./data
/// pool_size: 3
/// steps:
///   greet:
///     - name: hello_world alice
///       who: alice
///     - name: sleep nap
///       seconds: 0.5
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Work path for every step; relative to the file's directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_path: Option<PathBuf>,

    /// Worker count for every step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,

    /// Steps by name.
    #[serde(default)]
    pub steps: BTreeMap<String, Vec<TaskSpec>>,
}

impl PipelineConfig {
    /// Load a pipeline file. A relative `work_path` is resolved against the
    /// file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        if let (Some(work_path), Some(dir)) = (&config.work_path, path.parent()) {
            if work_path.is_relative() {
                config.work_path = Some(dir.join(work_path));
            }
        }
        Ok(config)
    }

    /// Parse pipeline YAML.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Build the Step named `name`.
    pub fn step(&self, name: &str) -> Result<Step, ConfigError> {
        let specs = self
            .steps
            .get(name)
            .ok_or_else(|| ConfigError::UnknownStep(name.to_string()))?;
        Step::from_specs(name, specs.iter().cloned())
            .map_err(|e| ConfigError::Invalid(format!("step '{name}': {e}")))
    }

    /// Declared step names, sorted.
    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }

    /// Apply the file's settings on top of `base`.
    pub fn apply(&self, mut base: RunConfig) -> RunConfig {
        if let Some(pool_size) = self.pool_size {
            base.pool_size = pool_size;
        }
        if let Some(work_path) = &self.work_path {
            base.work_path = work_path.clone();
        }
        base
    }
}
