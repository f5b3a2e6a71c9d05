//! Coordinator: runs a Step on a pool of worker processes.
//!
//! The coordinator is the only writer of the task graph. Everything it does
//! is a reaction to one pool event at a time (a pull, a report, a worker
//! exit), so no locking is involved. Every status change is written to the
//! manifest before the coordinator acts on it further.
//!
//! The first task failure or worker crash puts the run in halt mode: the
//! ready queue is emptied into SKIPPED, every worker is told to stop, and
//! workers still busy after the grace period are killed. Tasks whose worker
//! went away without reporting end FAILED with an aborted reason.

use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use serde_json::{Map, Value};
use steprun_core::{
    Artifact, Declaration, Diagnostic, FailureReason, Step, Task, TaskId, TaskSpec, TaskStatus,
    WorkerId,
};

use crate::config::RunConfig;
use crate::error::EngineError;
use crate::manifest::{ManifestError, ManifestWriter};
use crate::pool::{ExitKind, PoolEvent, WorkerPool};
use crate::protocol::{TaskAssignment, TaskOutcome, WorkerMessage};
use crate::registry::TaskRegistry;
use crate::task::TaskOutput;

const EVENT_BUFFER: usize = 256;

/// Runs Steps.
pub struct Coordinator {
    config: RunConfig,
    registry: TaskRegistry,
    manifest: Box<dyn ManifestWriter>,
}

impl Coordinator {
    /// Create a new Coordinator.
    ///
    /// `registry` is only used to vet task types before and during the run;
    /// the logic itself is built inside the worker processes from the
    /// worker program's own registry. The stock `steprun-worker` serves
    /// [`builtin_registry`](crate::builtin_registry). A registry with extra
    /// types needs a `worker_program` that registers the same types
    /// (a binary calling [`Worker::new`](crate::Worker::new) with it),
    /// otherwise those tasks fail validation in the worker.
    pub fn new(
        config: RunConfig,
        registry: TaskRegistry,
        manifest: impl ManifestWriter + 'static,
    ) -> Self {
        Self {
            config,
            registry,
            manifest: Box::new(manifest),
        }
    }

    /// Run configuration in use.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Run `step` to completion and return its final snapshot.
    ///
    /// Task failures, worker crashes and manifest write failures never turn
    /// into an `Err`: they are recorded on the returned Step. An `Err` means
    /// the step could not start (bad configuration, unknown task type,
    /// duplicate task names, or no worker pool).
    pub async fn run(&mut self, step: Step) -> Result<Step, EngineError> {
        self.config.validate()?;
        self.check_step(&step)?;

        info!(
            step = %step.name,
            tasks = step.tasks.len(),
            pool_size = self.config.pool_size,
            "Running step"
        );

        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);
        let pool = WorkerPool::spawn(&self.config, events_tx)?;

        let mut run = StepRun {
            step,
            index: HashMap::new(),
            ready: BTreeSet::new(),
            outstanding: 0,
            halted: false,
            halt_deadline: None,
            pool,
            config: &self.config,
            registry: &self.registry,
            manifest: &mut self.manifest,
        };
        run.start().await;
        run.drive(events).await;
        Ok(run.finish().await)
    }

    fn check_step(&self, step: &Step) -> Result<(), EngineError> {
        let mut names = HashSet::new();
        for task in &step.tasks {
            if task.name.trim().is_empty() || task.tag.is_empty() {
                return Err(EngineError::EmptyName);
            }
            if !self.registry.contains(&task.tag) {
                return Err(EngineError::UnknownTaskType {
                    task: task.name.clone(),
                    tag: task.tag.clone(),
                });
            }
            if task.status != TaskStatus::Pending {
                return Err(EngineError::NotPending {
                    task: task.name.clone(),
                    status: task.status,
                });
            }
            if !names.insert(task.name.as_str()) {
                return Err(EngineError::DuplicateTask(task.name.clone()));
            }
        }
        Ok(())
    }
}

/// State of one `run` call.
struct StepRun<'a> {
    step: Step,
    /// Position of each task in `step.tasks`.
    index: HashMap<TaskId, usize>,
    /// Tasks waiting for a worker, in declaration order.
    ready: BTreeSet<(Declaration, TaskId)>,
    /// RUNNING plus WAITING_ON_SUBTASKS.
    outstanding: usize,
    halted: bool,
    halt_deadline: Option<Instant>,
    pool: WorkerPool,
    config: &'a RunConfig,
    registry: &'a TaskRegistry,
    manifest: &'a mut Box<dyn ManifestWriter>,
}

impl StepRun<'_> {
    async fn start(&mut self) {
        self.step.started_at = Some(Utc::now());
        self.record_summary().await;

        for idx in 0..self.step.tasks.len() {
            let task = &self.step.tasks[idx];
            let (id, declaration) = (task.id.clone(), task.declaration.clone());
            self.index.insert(id.clone(), idx);
            self.record_created(&id).await;
            self.ready.insert((declaration, id));
        }
    }

    /// Process pool events until the step is complete or the halt drained.
    async fn drive(&mut self, mut events: mpsc::Receiver<PoolEvent>) {
        loop {
            if self.is_finished() {
                break;
            }

            let deadline = self.halt_deadline;
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        warn!(step = %self.step.name, "Every worker channel closed");
                        break;
                    }
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!(
                        step = %self.step.name,
                        live = self.pool.live(),
                        "Halt grace period elapsed, killing workers"
                    );
                    self.pool.kill_all();
                    self.halt_deadline = None;
                }
            }
        }
    }

    fn is_finished(&self) -> bool {
        if self.halted {
            self.pool.is_drained()
        } else {
            self.ready.is_empty() && self.outstanding == 0
        }
    }

    async fn finish(mut self) -> Step {
        if !self.pool.is_drained() {
            self.pool.shutdown().await;
        }
        self.resolve_leftovers().await;

        self.step.finished_at = Some(Utc::now());
        self.record_summary().await;

        info!(
            step = %self.step.name,
            status = %self.step.status(),
            done = self.step.count(TaskStatus::Done),
            failed = self.step.count(TaskStatus::Failed),
            skipped = self.step.count(TaskStatus::Skipped),
            diagnostics = self.step.diagnostics.len(),
            "Step finished"
        );
        self.step
    }

    async fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::Message { worker, message } => match message {
                WorkerMessage::Ready { pid, .. } => {
                    debug!(worker_id = %worker, pid, "Worker ready");
                }
                WorkerMessage::Pull => self.handle_pull(&worker).await,
                WorkerMessage::Report { task_id, outcome } => {
                    self.handle_report(&worker, task_id, outcome).await
                }
            },
            PoolEvent::Malformed { worker, error } => self.protocol_violation(&worker, error),
            PoolEvent::Closed { worker } => self.handle_exit(&worker).await,
        }
    }

    async fn handle_pull(&mut self, worker: &WorkerId) {
        if self.halted {
            if let Err(e) = self.pool.stop(worker).await {
                debug!(worker_id = %worker, error = %e, "Could not deliver stop");
            }
            return;
        }
        if let Some(task_id) = self.pool.assignment(worker).cloned() {
            self.protocol_violation(worker, format!("pull while task {task_id} is assigned"));
            return;
        }

        match self.ready.pop_first() {
            Some((_, task_id)) => self.dispatch(worker, task_id).await,
            None => {
                if let Err(e) = self.pool.idle(worker, self.config.idle_retry).await {
                    debug!(worker_id = %worker, error = %e, "Could not deliver idle");
                }
            }
        }
    }

    async fn dispatch(&mut self, worker: &WorkerId, task_id: TaskId) {
        if !self.set_status(&task_id, TaskStatus::Running, None).await {
            return;
        }
        let Some(assignment) = self.task(&task_id).map(TaskAssignment::from) else {
            return;
        };

        info!(worker_id = %worker, task_id = %task_id, name = %assignment.name, "Dispatching task");
        if let Err(e) = self.pool.assign(worker, assignment).await {
            // The worker's exit will be reaped with this task charged to it.
            warn!(worker_id = %worker, task_id = %task_id, error = %e, "Failed to send assignment");
        }
    }

    async fn handle_report(&mut self, worker: &WorkerId, task_id: TaskId, outcome: TaskOutcome) {
        if self.pool.assignment(worker) != Some(&task_id) {
            self.protocol_violation(worker, format!("report for unassigned task {task_id}"));
            return;
        }
        self.pool.release(worker);

        match outcome {
            TaskOutcome::Done { output } => {
                self.apply_output(&task_id, output.result, output.artifacts);
                if self.set_status(&task_id, TaskStatus::Done, None).await {
                    self.resolve_parents(&task_id).await;
                }
            }
            TaskOutcome::Spawned { output } => self.spawn_subtasks(&task_id, output).await,
            TaskOutcome::Failed { reason } => self.fail_task(&task_id, reason).await,
        }
    }

    async fn spawn_subtasks(&mut self, parent_id: &TaskId, output: TaskOutput) {
        let TaskOutput {
            subtasks,
            artifacts,
            result,
        } = output;

        if let Err(message) = self.check_subtasks(&subtasks) {
            self.fail_task(parent_id, FailureReason::validation(message))
                .await;
            return;
        }

        self.apply_output(parent_id, result, artifacts);
        if !self
            .set_status(parent_id, TaskStatus::WaitingOnSubtasks, None)
            .await
        {
            return;
        }
        let Some(&parent_idx) = self.index.get(parent_id) else {
            return;
        };
        let parent_declaration = self.step.tasks[parent_idx].declaration.clone();

        info!(task_id = %parent_id, count = subtasks.len(), "Task spawned subtasks");
        for (position, spec) in subtasks.into_iter().enumerate() {
            let declaration = parent_declaration.child(position as u32);
            let child = match Task::from_spec(spec, declaration.clone()) {
                Ok(task) => task.with_parent(parent_id.clone()),
                Err(e) => {
                    error!(task_id = %parent_id, error = %e, "Dropping malformed subtask");
                    continue;
                }
            };
            let child_id = child.id.clone();
            self.step.tasks[parent_idx].subtasks.push(child_id.clone());
            self.index.insert(child_id.clone(), self.step.tasks.len());
            self.step.tasks.push(child);
            self.record_created(&child_id).await;

            if self.halted {
                self.set_status(&child_id, TaskStatus::Skipped, None).await;
            } else {
                self.ready.insert((declaration, child_id));
            }
        }
    }

    /// Names stay unique across the whole step, spawned tasks included.
    fn check_subtasks(&self, specs: &[TaskSpec]) -> Result<(), String> {
        let mut names: HashSet<&str> = self.step.tasks.iter().map(|t| t.name.as_str()).collect();
        for spec in specs {
            let tag = spec
                .tag()
                .ok_or_else(|| "spawned a subtask with an empty name".to_string())?;
            if !self.registry.contains(tag) {
                return Err(format!(
                    "spawned subtask '{}' has unknown task type '{tag}'",
                    spec.name
                ));
            }
            if !names.insert(spec.name.as_str()) {
                return Err(format!(
                    "spawned subtask '{}' duplicates an existing task name",
                    spec.name
                ));
            }
        }
        Ok(())
    }

    async fn handle_exit(&mut self, worker: &WorkerId) {
        let exit = match self.pool.reap(worker).await {
            Ok(exit) => exit,
            Err(e) => ExitKind::Crashed {
                status: e.to_string(),
                task: self.pool.release(worker),
            },
        };

        match exit {
            ExitKind::Expected { task: None } => {}
            ExitKind::Expected {
                task: Some(task_id),
            } => {
                let reason = FailureReason::aborted(format!(
                    "worker {worker} was stopped before the task reported"
                ));
                self.fail_task(&task_id, reason).await;
            }
            ExitKind::Crashed {
                status,
                task: Some(task_id),
            } => {
                let reason = FailureReason::worker_crash(format!(
                    "worker {worker} exited unexpectedly ({status}); the task's outcome was lost"
                ));
                self.fail_task(&task_id, reason).await;
            }
            ExitKind::Crashed { status, task: None } => {
                let message = format!("worker exited unexpectedly while idle ({status})");
                error!(worker_id = %worker, "{}", message);
                self.step.diagnostics.push(Diagnostic::WorkerExited {
                    worker: worker.clone(),
                    message: message.clone(),
                });
                self.enter_halt(&message).await;
            }
        }
    }

    /// Fail a task, fail its waiting ancestors, and halt the run.
    async fn fail_task(&mut self, task_id: &TaskId, reason: FailureReason) {
        let name = self.task(task_id).map(|t| t.name.clone()).unwrap_or_default();
        error!(task_id = %task_id, name = %name, reason = %reason, "Task failed");

        if self.fail_with_ancestors(task_id, reason).await {
            self.enter_halt(&format!("task '{name}' failed")).await;
        }
    }

    async fn fail_with_ancestors(&mut self, task_id: &TaskId, reason: FailureReason) -> bool {
        if !self
            .set_status(task_id, TaskStatus::Failed, Some(reason))
            .await
        {
            return false;
        }

        let mut current = task_id.clone();
        loop {
            let Some(task) = self.task(&current) else {
                break;
            };
            let Some(parent_id) = task.parent.clone() else {
                break;
            };
            let inherited = match &task.failure_reason {
                Some(reason) => reason.propagated_from(&task.name),
                None => FailureReason::aborted(format!("subtask '{}' failed", task.name)),
            };
            if self.status(&parent_id) != Some(TaskStatus::WaitingOnSubtasks) {
                break;
            }
            self.set_status(&parent_id, TaskStatus::Failed, Some(inherited))
                .await;
            current = parent_id;
        }
        true
    }

    /// Complete waiting ancestors whose subtasks are now all DONE.
    async fn resolve_parents(&mut self, task_id: &TaskId) {
        let mut current = task_id.clone();
        while let Some(parent_id) = self.task(&current).and_then(|t| t.parent.clone()) {
            if self.status(&parent_id) != Some(TaskStatus::WaitingOnSubtasks) {
                break;
            }
            let statuses = self.child_statuses(&parent_id);
            if !statuses.iter().all(|s| *s == TaskStatus::Done) {
                break;
            }
            debug!(task_id = %parent_id, "All subtasks done");
            if !self.set_status(&parent_id, TaskStatus::Done, None).await {
                break;
            }
            current = parent_id;
        }
    }

    async fn enter_halt(&mut self, cause: &str) {
        if self.halted {
            return;
        }
        self.halted = true;
        warn!(
            step = %self.step.name,
            cause = %cause,
            pending = self.ready.len(),
            "Entering halt mode"
        );

        let pending = std::mem::take(&mut self.ready);
        for (_, task_id) in pending {
            self.set_status(&task_id, TaskStatus::Skipped, None).await;
        }
        self.pool.request_stop_all().await;
        self.halt_deadline = Some(Instant::now() + self.config.halt_grace);
    }

    /// Make every task terminal once the workers are gone.
    async fn resolve_leftovers(&mut self) {
        for task_id in self.ids_with(TaskStatus::Pending) {
            self.set_status(&task_id, TaskStatus::Skipped, None).await;
        }

        for task_id in self.ids_with(TaskStatus::Running) {
            let reason = FailureReason::aborted("worker ended before the task reported");
            self.fail_with_ancestors(&task_id, reason).await;
        }

        // Deepest first, so every parent sees terminal subtasks.
        let mut waiting: Vec<(usize, TaskId)> = self
            .step
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::WaitingOnSubtasks)
            .map(|t| (t.declaration.depth(), t.id.clone()))
            .collect();
        waiting.sort_by(|a, b| b.0.cmp(&a.0));

        for (_, task_id) in waiting {
            if self.status(&task_id) != Some(TaskStatus::WaitingOnSubtasks) {
                continue;
            }
            let statuses = self.child_statuses(&task_id);
            if statuses.iter().all(|s| *s == TaskStatus::Done) {
                self.set_status(&task_id, TaskStatus::Done, None).await;
            } else {
                let reason = FailureReason::aborted("subtasks never ran");
                self.set_status(&task_id, TaskStatus::Failed, Some(reason))
                    .await;
            }
        }
    }

    /// Apply a status change and mirror it to the manifest.
    ///
    /// Returns false when the state machine rejects the change; the task is
    /// left untouched.
    async fn set_status(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        reason: Option<FailureReason>,
    ) -> bool {
        let Some(&idx) = self.index.get(task_id) else {
            error!(task_id = %task_id, "Status change for unknown task");
            return false;
        };

        let task = &mut self.step.tasks[idx];
        let previous = task.status;
        if let Err(e) = task.transition(status) {
            error!(task_id = %task_id, error = %e, "Rejected status change");
            return false;
        }
        if let Some(reason) = reason {
            task.failure_reason = Some(reason);
        }

        match (previous.is_active(), status.is_active()) {
            (false, true) => self.outstanding += 1,
            (true, false) => self.outstanding = self.outstanding.saturating_sub(1),
            _ => {}
        }
        debug!(task_id = %task_id, from = %previous, to = %status, "Task status changed");

        let task = &self.step.tasks[idx];
        let written = self
            .manifest
            .record_transition(task, status, task.failure_reason.as_ref())
            .await;
        if let Err(e) = written {
            self.manifest_failed(Some(task_id.clone()), e);
        }
        true
    }

    async fn record_created(&mut self, task_id: &TaskId) {
        let Some(&idx) = self.index.get(task_id) else {
            return;
        };
        let written = self.manifest.record_created(&self.step.tasks[idx]).await;
        if let Err(e) = written {
            self.manifest_failed(Some(task_id.clone()), e);
        }
    }

    async fn record_summary(&mut self) {
        let written = self.manifest.record_step_summary(&self.step).await;
        if let Err(e) = written {
            self.manifest_failed(None, e);
        }
    }

    fn manifest_failed(&mut self, task: Option<TaskId>, error: ManifestError) {
        warn!(step = %self.step.name, task_id = ?task, error = %error, "Manifest write failed");
        self.step.diagnostics.push(Diagnostic::ManifestWrite {
            task,
            message: error.to_string(),
        });
    }

    fn protocol_violation(&mut self, worker: &WorkerId, message: String) {
        warn!(worker_id = %worker, message = %message, "Protocol violation");
        self.step.diagnostics.push(Diagnostic::Protocol {
            worker: worker.clone(),
            message,
        });
    }

    fn apply_output(
        &mut self,
        task_id: &TaskId,
        result: Map<String, Value>,
        artifacts: Vec<Artifact>,
    ) {
        if let Some(&idx) = self.index.get(task_id) {
            let task = &mut self.step.tasks[idx];
            task.result = result;
            task.artifacts = artifacts;
        }
    }

    fn task(&self, task_id: &TaskId) -> Option<&Task> {
        self.index.get(task_id).map(|&idx| &self.step.tasks[idx])
    }

    fn status(&self, task_id: &TaskId) -> Option<TaskStatus> {
        self.task(task_id).map(|t| t.status)
    }

    fn child_statuses(&self, task_id: &TaskId) -> Vec<TaskStatus> {
        self.step
            .subtasks_of(task_id)
            .iter()
            .map(|t| t.status)
            .collect()
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<TaskId> {
        self.step
            .tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::MemoryManifest;
    use crate::tasks::builtin_registry;

    fn coordinator(config: RunConfig) -> Coordinator {
        Coordinator::new(config, builtin_registry(), MemoryManifest::new())
    }

    #[tokio::test]
    async fn test_unknown_task_type_rejected_before_start() {
        let step = Step::from_specs("s", [TaskSpec::new("teleport a")]).unwrap();
        let err = coordinator(RunConfig::default()).run(step).await.unwrap_err();
        match err {
            EngineError::UnknownTaskType { task, tag } => {
                assert_eq!(task, "teleport a");
                assert_eq!(tag, "teleport");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_duplicate_names_rejected() {
        let step = Step::from_specs(
            "s",
            [TaskSpec::new("hello_world a"), TaskSpec::new("hello_world a")],
        )
        .unwrap();
        let err = coordinator(RunConfig::default()).run(step).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateTask(name) if name == "hello_world a"));
    }

    #[tokio::test]
    async fn test_pool_of_one_rejected() {
        let step = Step::from_specs("s", [TaskSpec::new("hello_world a")]).unwrap();
        let config = RunConfig::default().with_pool_size(1);
        let err = coordinator(config).run(step).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_non_pending_task_rejected() {
        let mut step = Step::from_specs("s", [TaskSpec::new("hello_world a")]).unwrap();
        step.tasks[0].transition(TaskStatus::Skipped).unwrap();
        let err = coordinator(RunConfig::default()).run(step).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::NotPending {
                status: TaskStatus::Skipped,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_missing_worker_program_is_pool_error() {
        let step = Step::from_specs("s", [TaskSpec::new("hello_world a")]).unwrap();
        let config = RunConfig::new("/nonexistent/steprun-worker-missing");
        let err = coordinator(config).run(step).await.unwrap_err();
        assert!(matches!(err, EngineError::Pool(_)));
    }
}
