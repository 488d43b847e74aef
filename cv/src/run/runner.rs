//! Runner - discovery, wave execution, failure policy and checkpoints
//!
//! ```text
//! goal ─▶ discover ─▶ tasks ─▶ wave 0 ─▶ checkpoint ─▶ wave 1 ─▶ ... ─▶ outcome
//!                                │
//!                           failures ─▶ continue: skip dependents
//!                                       retry:    backoff, re-run, then continue
//!                                       abort:    checkpoint, stop
//!                                       replan:   rediscover remaining work
//! ```

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::RunContext;
use super::task_runner::{TaskRunner, target_of};
use crate::checkpoint::{AgentCheckpoint, CheckpointWriter};
use crate::coordinator::{FailurePolicy, TaskExecutionConfig};
use crate::domain::{Task, TaskMode, TaskStatus, generate_id};
use crate::error::{ExecError, ExecResult};
use crate::events::{Event, EventEmitter, JsonlHook};
use crate::gate::{GateCascade, default_gates};
use crate::graph::{Discoverer, layer_waves};

/// File the run's events are appended to, inside its checkpoint directory
pub const EVENT_LOG_FILE: &str = "events.jsonl";

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every task completed and every run-level gate passed
    Succeeded,
    /// Finished with failed or skipped tasks
    Failed,
    /// Stopped by the abort policy
    Aborted,
    Cancelled,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Aborted => write!(f, "aborted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    pub skipped: Vec<String>,
    /// Run-level gates that did not pass
    pub gate_failures: Vec<String>,
    /// Checkpoint to resume from
    pub checkpoint_path: Option<PathBuf>,
    pub reason: String,
    pub tokens_used: u64,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Succeeded
    }

    /// Aborted and cancelled runs as [`ExecError::Aborted`]
    pub fn into_result(self) -> ExecResult<RunOutcome> {
        match self.status {
            RunStatus::Aborted | RunStatus::Cancelled => Err(ExecError::Aborted {
                reason: self.reason,
                checkpoint: self.checkpoint_path,
            }),
            RunStatus::Succeeded | RunStatus::Failed => Ok(self),
        }
    }
}

/// Mutable state of one run in progress
struct RunState {
    run_id: String,
    goal: String,
    tasks: Vec<Task>,
    execution: TaskExecutionConfig,
    writer: CheckpointWriter,
    emitter: EventEmitter,
    replans: u32,
    next_wave: usize,
    post_gates_done: HashSet<String>,
    gate_failures: Vec<String>,
    tokens_used: u64,
}

impl RunState {
    fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn ids_with(&self, status: TaskStatus) -> Vec<String> {
        self.tasks
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    }

    /// Files a task reads from its dependencies
    fn dependency_paths(&self, task: &Task) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dep in task.depends_on.iter().filter_map(|d| self.task(d)) {
            match (&dep.target, dep.mode) {
                (Some(target), _) => paths.push(target.clone()),
                (None, TaskMode::Generate) => paths.push(target_of(dep)),
                (None, TaskMode::Composite) => paths.extend(self.dependency_paths(dep)),
                (None, TaskMode::Verify) => {}
            }
        }
        paths.dedup();
        paths
    }
}

/// Drives runs over one [`RunContext`]
pub struct Runner {
    ctx: Arc<RunContext>,
}

impl Runner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn context(&self) -> &Arc<RunContext> {
        &self.ctx
    }

    /// Newest checkpoint under the context's checkpoint root
    pub fn latest_checkpoint(&self) -> ExecResult<Option<PathBuf>> {
        Ok(self.ctx.store.latest()?)
    }

    /// Discover the goal's artifacts and execute them
    pub async fn run(&self, goal: &str) -> ExecResult<RunOutcome> {
        let run_id = generate_id("run", goal);
        debug!(%run_id, %goal, "Runner::run: called");
        let emitter = self.ctx.bus.emitter_for(&run_id);
        let run_dir = self.ctx.store.create_run(Utc::now())?;
        self.record_events(&run_dir, &emitter);

        emitter.emit(Event::RunStarted {
            run_id: run_id.clone(),
            goal: goal.to_string(),
            resumed: false,
        });

        let graph = match self.discoverer().discover(goal, "", &emitter).await {
            Ok(graph) => graph,
            Err(e) => {
                warn!(%run_id, error = %e, "Discovery failed");
                emitter.emit(Event::RunCompleted {
                    run_id,
                    status: RunStatus::Failed.to_string(),
                    completed: 0,
                    failed: 0,
                    skipped: 0,
                    reason: e.to_string(),
                });
                return Err(e);
            }
        };
        info!(%run_id, artifacts = graph.len(), waves = graph.max_depth(), "Discovery complete");

        let checkpoint = AgentCheckpoint::new(
            run_id,
            goal,
            graph.to_tasks(),
            self.ctx.working_dir(),
            self.ctx.settings.execution.clone(),
            self.ctx.settings.parallel.clone(),
        );
        self.execute(checkpoint, run_dir, emitter).await
    }

    /// Continue a run from a checkpoint; completed tasks are never re-run
    pub async fn resume(&self, path: &Path) -> ExecResult<RunOutcome> {
        debug!(path = %path.display(), "Runner::resume: called");
        let mut checkpoint = AgentCheckpoint::load(&self.ctx.store, path)?;
        let run_dir = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let emitter = self.ctx.bus.emitter_for(&checkpoint.run_id);
        self.record_events(&run_dir, &emitter);

        if checkpoint.working_directory != self.ctx.working_dir() {
            emitter.warning(
                "resume",
                format!(
                    "checkpoint was taken in {}, resuming in {}",
                    checkpoint.working_directory.display(),
                    self.ctx.working_dir().display()
                ),
            );
        }

        let completed: BTreeSet<String> = checkpoint.completed_ids.iter().cloned().collect();
        for task in &mut checkpoint.tasks {
            if completed.contains(&task.id) {
                task.status = TaskStatus::Completed;
            } else if task.status != TaskStatus::Completed {
                // interrupted, failed and skipped work gets another chance
                task.status = TaskStatus::Pending;
            }
        }
        info!(
            run_id = %checkpoint.run_id,
            remaining = checkpoint.remaining_tasks().len(),
            "Resuming run"
        );

        emitter.emit(Event::RunStarted {
            run_id: checkpoint.run_id.clone(),
            goal: checkpoint.goal.clone(),
            resumed: true,
        });
        self.execute(checkpoint, run_dir, emitter).await
    }

    fn discoverer(&self) -> Discoverer {
        Discoverer::new(
            self.ctx.oracle.clone(),
            self.ctx.prompts.clone(),
            self.ctx.settings.discovery.clone(),
        )
    }

    fn record_events(&self, run_dir: &Path, emitter: &EventEmitter) {
        if !self.ctx.settings.record_events {
            return;
        }
        match JsonlHook::create(run_dir.join(EVENT_LOG_FILE)) {
            Ok(hook) => self.ctx.bus.register_hook(Arc::new(hook)),
            Err(e) => emitter.warning("events", format!("cannot record events: {}", e)),
        }
    }

    /// Builtin chain plus the custom gates that apply to every task
    fn task_cascade(&self) -> ExecResult<GateCascade> {
        let mut gates = default_gates(&self.ctx.settings.convergence.enabled_gates);
        gates.extend(self.ctx.gates.iter().filter(|g| g.after_tasks.is_empty()).cloned());
        GateCascade::new(gates, self.ctx.gate_runner.clone())
    }

    async fn execute(
        &self,
        checkpoint: AgentCheckpoint,
        run_dir: PathBuf,
        emitter: EventEmitter,
    ) -> ExecResult<RunOutcome> {
        let execution = checkpoint.execution_config.clone();
        let writer = CheckpointWriter::spawn(
            self.ctx.store.clone(),
            run_dir,
            checkpoint.clone(),
            emitter.clone(),
            execution.checkpoint_interval(),
        );
        let task_runner = Arc::new(TaskRunner::new(self.ctx.clone(), Arc::new(self.task_cascade()?)));

        let mut state = RunState {
            run_id: checkpoint.run_id,
            goal: checkpoint.goal,
            tasks: checkpoint.tasks,
            execution,
            writer,
            emitter,
            replans: 0,
            next_wave: 0,
            post_gates_done: HashSet::new(),
            gate_failures: Vec::new(),
            tokens_used: 0,
        };
        let mut waves: VecDeque<Vec<String>> = pending_waves(&state.tasks)?.into();

        while let Some(wave) = waves.pop_front() {
            if self.ctx.cancel.is_cancelled() {
                return self.finish(state, RunStatus::Cancelled, "run cancelled".to_string()).await;
            }
            let ids: Vec<String> = wave
                .into_iter()
                .filter(|id| state.task(id).is_some_and(|t| !t.is_done()))
                .collect();
            if ids.is_empty() {
                continue;
            }

            let wave_no = state.next_wave;
            state.next_wave += 1;
            info!(run_id = %state.run_id, wave = wave_no, tasks = ids.len(), "Starting wave");
            state.emitter.emit(Event::WaveStarted {
                run_id: state.run_id.clone(),
                wave: wave_no,
                task_ids: ids.clone(),
            });

            let failures = self.run_wave(&mut state, &task_runner, &ids).await?;
            state.emitter.emit(Event::WaveCompleted {
                run_id: state.run_id.clone(),
                wave: wave_no,
                completed: ids.len() - failures.len(),
                failed: failures.len(),
            });

            if !failures.is_empty() {
                match state.execution.failure_policy {
                    FailurePolicy::Continue | FailurePolicy::Retry => {
                        self.skip_dependents(&mut state, &failures).await?;
                    }
                    FailurePolicy::Abort => {
                        let (id, error) = &failures[0];
                        let reason = format!("task {} failed: {}", id, error);
                        state.writer.save_wave(wave_no).await?;
                        return self.finish(state, RunStatus::Aborted, reason).await;
                    }
                    FailurePolicy::Replan if state.replans < state.execution.max_replans => {
                        state.replans += 1;
                        match self.replan(&mut state, &failures).await {
                            Ok(new_waves) => {
                                state.writer.save_wave(wave_no).await?;
                                waves = new_waves.into();
                                continue;
                            }
                            Err(e) if e.is_fatal() => {
                                state.writer.save_wave(wave_no).await?;
                                return self.finish(state, RunStatus::Failed, format!("replanning failed: {}", e)).await;
                            }
                            Err(e) => {
                                state.emitter.warning("replan", e.to_string());
                                self.skip_dependents(&mut state, &failures).await?;
                            }
                        }
                    }
                    FailurePolicy::Replan => {
                        state.emitter.warning("replan", "replan budget exhausted, continuing");
                        self.skip_dependents(&mut state, &failures).await?;
                    }
                }
            }

            state.writer.save_wave(wave_no).await?;
            self.run_post_gates(&mut state).await;
        }

        let failed = state.ids_with(TaskStatus::Failed);
        let skipped = state.ids_with(TaskStatus::Skipped);
        if failed.is_empty() && skipped.is_empty() && state.gate_failures.is_empty() {
            let reason = format!("all {} tasks completed", state.tasks.len());
            return self.finish(state, RunStatus::Succeeded, reason).await;
        }
        let mut reason = format!("{} failed, {} skipped", failed.len(), skipped.len());
        if let Some(error) = failed
            .first()
            .and_then(|id| state.task(id))
            .and_then(|t| t.last_error.as_deref())
        {
            reason.push_str(&format!("; first failure: {}", error));
        }
        if !state.gate_failures.is_empty() {
            reason.push_str(&format!("; gates not passing: {}", state.gate_failures.join(", ")));
        }
        self.finish(state, RunStatus::Failed, reason).await
    }

    /// Execute one wave, re-running failures under the retry policy
    ///
    /// Returns the tasks that are still failed, with their errors.
    async fn run_wave(
        &self,
        state: &mut RunState,
        task_runner: &Arc<TaskRunner>,
        ids: &[String],
    ) -> ExecResult<Vec<(String, String)>> {
        let mut pending: Vec<String> = ids.to_vec();
        let mut permanent: Vec<(String, String)> = Vec::new();
        let mut round = 0u32;

        loop {
            let mut units = Vec::with_capacity(pending.len());
            for id in &pending {
                let Some(task) = state.task_mut(id) else { continue };
                task.mark_running();
                let task = task.clone();
                let deps = state.dependency_paths(&task);
                state.writer.update_task(task.clone()).await?;
                state.emitter.emit(Event::TaskStarted {
                    run_id: state.run_id.clone(),
                    task_id: task.id.clone(),
                    mode: task.mode.to_string(),
                    attempt: task.attempts,
                });

                let runner = task_runner.clone();
                let events = state.emitter.for_task(&task.id);
                units.push((id.clone(), async move { runner.execute(&task, &deps, events).await }));
            }

            let results = self.ctx.coordinator.execute(units).await;
            let mut retryable = Vec::new();
            for result in results {
                let Some(task) = state.task_mut(&result.id) else { continue };
                let mut tokens = 0;
                let error = match result.outcome {
                    Ok(report) => {
                        if task.target.is_none() && task.mode == TaskMode::Generate {
                            task.target = report.artifacts.first().cloned();
                        }
                        task.mark_completed();
                        tokens = report.tokens_used;
                        None
                    }
                    Err(e) => {
                        task.mark_failed(e.to_string());
                        Some(e)
                    }
                };
                let task = task.clone();
                state.tokens_used += tokens;
                state.writer.update_task(task.clone()).await?;
                state.emitter.emit(Event::TaskCompleted {
                    run_id: state.run_id.clone(),
                    task_id: task.id.clone(),
                    success: error.is_none(),
                    error: error.as_ref().map(ToString::to_string),
                });
                match error {
                    Some(e) if e.is_fatal() => {
                        warn!(task_id = %task.id, error = %e, "Task failed permanently");
                        permanent.push((task.id, e.to_string()));
                    }
                    Some(e) => {
                        warn!(task_id = %task.id, error = %e, "Task failed");
                        retryable.push((task.id, e.to_string()));
                    }
                    None => info!(task_id = %task.id, "Task completed"),
                }
            }

            let retries_left = round < state.execution.max_retries_per_task;
            if retryable.is_empty() || state.execution.failure_policy != FailurePolicy::Retry || !retries_left {
                permanent.extend(retryable);
                return Ok(permanent);
            }

            round += 1;
            let backoff = state.execution.retry_backoff(round);
            info!(round, backoff_ms = backoff.as_millis() as u64, tasks = retryable.len(), "Retrying failed tasks");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.ctx.cancel.cancelled() => {
                    permanent.extend(retryable);
                    return Ok(permanent);
                }
            }
            pending = retryable.into_iter().map(|(id, _)| id).collect();
        }
    }

    async fn skip_dependents(&self, state: &mut RunState, failures: &[(String, String)]) -> ExecResult<()> {
        for (id, reason) in dependents_to_skip(&state.tasks, failures) {
            let Some(task) = state.task_mut(&id) else { continue };
            task.mark_skipped(reason.clone());
            let task = task.clone();
            debug!(task_id = %id, %reason, "Skipping task");
            state.writer.update_task(task).await?;
            state.emitter.emit(Event::TaskSkipped {
                run_id: state.run_id.clone(),
                task_id: id,
                reason,
            });
        }
        Ok(())
    }

    /// Rediscover the remaining work; completed tasks are kept as they are
    async fn replan(&self, state: &mut RunState, failures: &[(String, String)]) -> ExecResult<Vec<Vec<String>>> {
        info!(run_id = %state.run_id, replan = state.replans, "Replanning");
        let context = replan_context(&state.tasks, failures);
        let graph = self.discoverer().discover(&state.goal, &context, &state.emitter).await?;

        let completed: HashSet<String> = state.ids_with(TaskStatus::Completed).into_iter().collect();
        let mut tasks: Vec<Task> = state
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed)
            .cloned()
            .collect();
        tasks.extend(graph.to_tasks().into_iter().filter(|t| !completed.contains(&t.id)));

        let waves = pending_waves(&tasks)?;
        state.tasks = tasks;
        state.writer.replace_tasks(state.tasks.clone()).await?;
        state.writer.set_context("replans", serde_json::json!(state.replans)).await?;
        state
            .writer
            .set_context("replanned_after", serde_json::json!(failures))
            .await?;
        Ok(waves)
    }

    /// Run-level gates whose `after_tasks` have all completed
    async fn run_post_gates(&self, state: &mut RunState) {
        for gate in self.ctx.gates.iter().filter(|g| !g.after_tasks.is_empty()) {
            if state.post_gates_done.contains(&gate.id) {
                continue;
            }
            let ready = gate
                .after_tasks
                .iter()
                .all(|id| state.task(id).is_some_and(|t| t.status == TaskStatus::Completed));
            if !ready {
                continue;
            }
            state.post_gates_done.insert(gate.id.clone());

            let mut files = Vec::new();
            let mut contracts = Vec::new();
            for task in gate.after_tasks.iter().filter_map(|id| state.task(id)) {
                match &task.target {
                    Some(target) => files.push(target.clone()),
                    None => files.extend(state.dependency_paths(task)),
                }
                if !task.contract.is_empty() {
                    contracts.push(task.contract.clone());
                }
            }
            files.sort();
            files.dedup();

            let mut single = gate.clone();
            single.requires.clear();
            let cascade = match GateCascade::new(vec![single], self.ctx.gate_runner.clone()) {
                Ok(cascade) => cascade,
                Err(e) => {
                    state.emitter.warning("gate", e.to_string());
                    continue;
                }
            };
            let snapshot = match self.ctx.workspace.snapshot(&files).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    state.emitter.warning("gate", e.to_string());
                    state.gate_failures.push(gate.id.clone());
                    continue;
                }
            };
            let report = cascade.run(&snapshot, &contracts.join("\n"), Some(&state.emitter)).await;
            if !report.passed() {
                warn!(gate_id = %gate.id, "Run-level gate failed");
                state.gate_failures.push(gate.id.clone());
            }
        }
    }

    async fn finish(&self, state: RunState, status: RunStatus, reason: String) -> ExecResult<RunOutcome> {
        let checkpoint_path = state.writer.shutdown().await?;
        let outcome = RunOutcome {
            status,
            completed: state.ids_with(TaskStatus::Completed),
            failed: state.ids_with(TaskStatus::Failed),
            skipped: state.ids_with(TaskStatus::Skipped),
            gate_failures: state.gate_failures,
            checkpoint_path,
            reason,
            tokens_used: state.tokens_used,
            run_id: state.run_id,
        };
        info!(run_id = %outcome.run_id, %status, reason = %outcome.reason, "Run finished");
        state.emitter.emit(Event::RunCompleted {
            run_id: outcome.run_id.clone(),
            status: status.to_string(),
            completed: outcome.completed.len(),
            failed: outcome.failed.len(),
            skipped: outcome.skipped.len(),
            reason: outcome.reason.clone(),
        });
        Ok(outcome)
    }
}

/// Waves over the tasks that still need work
fn pending_waves(tasks: &[Task]) -> ExecResult<Vec<Vec<String>>> {
    layer_waves(
        tasks
            .iter()
            .filter(|t| !t.is_done())
            .map(|t| (t.id.as_str(), t.depends_on.as_slice())),
    )
}

/// Every not-yet-finished task that transitively depends on a failure
fn dependents_to_skip(tasks: &[Task], failures: &[(String, String)]) -> Vec<(String, String)> {
    let mut blocked: HashSet<&str> = failures.iter().map(|(id, _)| id.as_str()).collect();
    let mut skipped = Vec::new();
    loop {
        let mut changed = false;
        for task in tasks {
            if blocked.contains(task.id.as_str()) || task.status.is_terminal() {
                continue;
            }
            if let Some(dep) = task.depends_on.iter().find(|d| blocked.contains(d.as_str())) {
                skipped.push((task.id.clone(), format!("dependency {} did not complete", dep)));
                blocked.insert(task.id.as_str());
                changed = true;
            }
        }
        if !changed {
            return skipped;
        }
    }
}

fn replan_context(tasks: &[Task], failures: &[(String, String)]) -> String {
    let mut context = String::from("Already completed (do not plan these again):\n");
    for task in tasks.iter().filter(|t| t.status == TaskStatus::Completed) {
        match &task.target {
            Some(target) => context.push_str(&format!("- {} ({})\n", task.id, target.display())),
            None => context.push_str(&format!("- {}\n", task.id)),
        }
    }
    context.push_str("\nFailed in the previous plan:\n");
    for (id, error) in failures {
        context.push_str(&format!("- {}: {}\n", id, error));
    }
    context
}
