//! Task - the runtime counterpart of an ArtifactSpec

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::artifact::{ArtifactSpec, TaskMode};

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    /// Not attempted because a dependency failed
    Skipped,
}

impl TaskStatus {
    /// No further work will happen on this task in the current run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// A unit of executable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,

    pub description: String,

    /// Ids of tasks that must complete first, in discovery order
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub mode: TaskMode,

    #[serde(default)]
    pub status: TaskStatus,

    #[serde(default)]
    pub contract: String,

    /// File the task writes or verifies
    #[serde(default)]
    pub target: Option<PathBuf>,

    /// Execution attempts so far
    #[serde(default)]
    pub attempts: u32,

    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            depends_on: Vec::new(),
            mode: TaskMode::Generate,
            status: TaskStatus::Pending,
            contract: String::new(),
            target: None,
            attempts: 0,
            last_error: None,
        }
    }

    pub fn with_depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_target(mut self, target: impl Into<PathBuf>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Completed or skipped; either way there is nothing left to do
    pub fn is_done(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Skipped)
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.attempts += 1;
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.last_error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.last_error = Some(error.into());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Skipped;
        self.last_error = Some(reason.into());
    }
}

impl From<&ArtifactSpec> for Task {
    fn from(spec: &ArtifactSpec) -> Self {
        Self {
            id: spec.id.clone(),
            description: spec.description.clone(),
            depends_on: spec.requires.clone(),
            mode: spec.mode,
            status: TaskStatus::Pending,
            contract: spec.contract.clone(),
            target: spec.produces.clone(),
            attempts: 0,
            last_error: None,
        }
    }
}
