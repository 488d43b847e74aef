//! TaskRunner - executes one task according to its mode

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::RunContext;
use crate::convergence::{ConvergenceLoop, ConvergenceResult};
use crate::domain::{Task, TaskMode, slugify};
use crate::error::{ExecError, ExecResult};
use crate::events::EventEmitter;
use crate::gate::{GateCascade, GateType};
use crate::oracle::{OracleError, TemplateName, strip_code_fence};

/// What a finished task produced
#[derive(Debug, Clone, Default)]
pub struct TaskReport {
    pub task_id: String,
    pub artifacts: Vec<PathBuf>,
    pub convergence: Option<ConvergenceResult>,
    pub tokens_used: u64,
}

#[derive(Serialize)]
struct DependencyFile {
    path: String,
    content: String,
}

#[derive(Serialize)]
struct GenerateContext<'a> {
    target: String,
    description: &'a str,
    contract: &'a str,
    dependencies: Vec<DependencyFile>,
}

/// File a task writes; tasks without one get `{slug}.txt`
pub fn target_of(task: &Task) -> PathBuf {
    task.target
        .clone()
        .unwrap_or_else(|| PathBuf::from(format!("{}.txt", slugify(&task.id))))
}

/// Shared by every unit of a run
pub struct TaskRunner {
    ctx: Arc<RunContext>,
    cascade: Arc<GateCascade>,
}

impl TaskRunner {
    pub fn new(ctx: Arc<RunContext>, cascade: Arc<GateCascade>) -> Self {
        Self { ctx, cascade }
    }

    /// `dependencies` are the targets of the task's dependencies, in order
    pub async fn execute(&self, task: &Task, dependencies: &[PathBuf], events: EventEmitter) -> ExecResult<TaskReport> {
        debug!(task_id = %task.id, mode = %task.mode, "TaskRunner::execute: called");
        match task.mode {
            TaskMode::Generate => self.generate(task, dependencies, events).await,
            TaskMode::Composite => self.composite(task, dependencies).await,
            TaskMode::Verify => self.verify(task, dependencies, events).await,
        }
    }

    async fn generate(&self, task: &Task, dependencies: &[PathBuf], events: EventEmitter) -> ExecResult<TaskReport> {
        let target = target_of(task);
        let workspace = &self.ctx.workspace;

        let mut dep_files = Vec::with_capacity(dependencies.len());
        for path in dependencies {
            if let Some(content) = workspace.read(path).await? {
                dep_files.push(DependencyFile {
                    path: path.display().to_string(),
                    content,
                });
            }
        }

        let prompt = self.ctx.prompts.render(
            TemplateName::Generate,
            &GenerateContext {
                target: target.display().to_string(),
                description: &task.description,
                contract: &task.contract,
                dependencies: dep_files,
            },
        )?;
        let generation = self.ctx.oracle.generate(&prompt, &self.ctx.settings.generate).await?;
        let content = strip_code_fence(&generation.content);
        if content.trim().is_empty() {
            return Err(OracleError::InvalidResponse(format!("empty artifact for {}", target.display())).into());
        }
        workspace.write(&target, &content).await?;
        info!(task_id = %task.id, target = %target.display(), "Artifact generated");

        let convergence = ConvergenceLoop::new(
            self.ctx.settings.convergence.clone(),
            self.cascade.clone(),
            self.ctx.oracle.clone(),
            workspace.clone(),
            events,
        )
        .with_cancel(self.ctx.cancel.clone())
        .run(std::slice::from_ref(&target), &task.contract)
        .await
        .into_result()?;

        Ok(TaskReport {
            task_id: task.id.clone(),
            artifacts: vec![target],
            tokens_used: generation.usage.total() + convergence.tokens_used,
            convergence: Some(convergence),
        })
    }

    async fn composite(&self, task: &Task, dependencies: &[PathBuf]) -> ExecResult<TaskReport> {
        let mut missing = Vec::new();
        for path in dependencies {
            if !self.ctx.workspace.exists(path).await {
                missing.push(format!("missing artifact {}", path.display()));
            }
        }
        if !missing.is_empty() {
            return Err(ExecError::Validation {
                gate_type: GateType::Import,
                errors: missing,
            });
        }
        Ok(TaskReport {
            task_id: task.id.clone(),
            artifacts: dependencies.to_vec(),
            ..Default::default()
        })
    }

    /// One cascade pass, no repair
    async fn verify(&self, task: &Task, dependencies: &[PathBuf], events: EventEmitter) -> ExecResult<TaskReport> {
        let files: Vec<PathBuf> = match &task.target {
            Some(target) => vec![target.clone()],
            None => dependencies.to_vec(),
        };
        if let Some(path) = first_missing(&self.ctx, &files).await {
            return Err(ExecError::Validation {
                gate_type: GateType::Syntax,
                errors: vec![format!("nothing to verify: {} does not exist", path.display())],
            });
        }
        let snapshot = self.ctx.workspace.snapshot(&files).await?;
        let report = self.cascade.run(&snapshot, &task.contract, Some(&events)).await;
        if let Some(failure) = report.failures().next() {
            return Err(ExecError::Validation {
                gate_type: failure.gate_type,
                errors: failure.errors.clone(),
            });
        }
        Ok(TaskReport {
            task_id: task.id.clone(),
            artifacts: files,
            ..Default::default()
        })
    }
}

async fn first_missing(ctx: &RunContext, files: &[PathBuf]) -> Option<PathBuf> {
    for path in files {
        if !ctx.workspace.exists(path).await {
            return Some(path.clone());
        }
    }
    if files.is_empty() {
        return Some(Path::new(".").to_path_buf());
    }
    None
}
