//! Agent checkpoint - everything needed to resume a run without rediscovery
//!
//! The file format is a single JSON object written atomically by
//! `runstore::CheckpointStore`. Loading validates that every completed id
//! names a known task; a file that violates this is reported as corrupt.

mod writer;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use runstore::CheckpointStore;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::coordinator::{ParallelConfig, TaskExecutionConfig};
use crate::domain::{Task, TaskStatus};
use crate::error::{ExecError, ExecResult};

pub use writer::CheckpointWriter;

/// Persisted run state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCheckpoint {
    pub run_id: String,

    pub goal: String,

    pub started_at: DateTime<Utc>,

    pub checkpoint_at: DateTime<Utc>,

    /// All tasks of the run, in wave order
    pub tasks: Vec<Task>,

    pub completed_ids: Vec<String>,

    /// Files produced so far
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,

    pub working_directory: PathBuf,

    /// Free-form notes carried across resumes
    #[serde(default)]
    pub context: BTreeMap<String, serde_json::Value>,

    #[serde(default)]
    pub execution_config: TaskExecutionConfig,

    #[serde(default)]
    pub parallel_config: ParallelConfig,
}

impl AgentCheckpoint {
    pub fn new(
        run_id: impl Into<String>,
        goal: impl Into<String>,
        tasks: Vec<Task>,
        working_directory: impl Into<PathBuf>,
        execution_config: TaskExecutionConfig,
        parallel_config: ParallelConfig,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            goal: goal.into(),
            started_at: now,
            checkpoint_at: now,
            tasks,
            completed_ids: Vec::new(),
            artifacts: Vec::new(),
            working_directory: working_directory.into(),
            context: BTreeMap::new(),
            execution_config,
            parallel_config,
        }
    }

    /// Every completed id must name a task
    pub fn validate(&self, path: &Path) -> ExecResult<()> {
        let known: BTreeSet<&str> = self.tasks.iter().map(|t| t.id.as_str()).collect();
        if let Some(unknown) = self.completed_ids.iter().find(|id| !known.contains(id.as_str())) {
            return Err(ExecError::CheckpointCorrupt {
                path: path.to_path_buf(),
                reason: format!("completed id '{}' is not a task of this run", unknown),
            });
        }
        Ok(())
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed_ids.iter().any(|c| c == id)
    }

    /// Tasks that still need work, in stored order
    pub fn remaining_tasks(&self) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| !self.is_completed(&t.id) && !t.is_done())
            .collect()
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// Replace the stored copy of a task; completion is mirrored into `completed_ids`
    pub fn update_task(&mut self, task: Task) {
        if task.status == TaskStatus::Completed && !self.is_completed(&task.id) {
            self.completed_ids.push(task.id.clone());
        }
        if let Some(target) = &task.target
            && task.status == TaskStatus::Completed
            && !self.artifacts.contains(target)
        {
            self.artifacts.push(target.clone());
        }
        match self.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(slot) => *slot = task,
            None => self.tasks.push(task),
        }
    }

    pub fn progress_summary(&self) -> ProgressSummary {
        let count = |status: TaskStatus| self.tasks.iter().filter(|t| t.status == status).count();
        let completed = self
            .tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Completed || self.is_completed(&t.id))
            .count();
        ProgressSummary {
            total: self.tasks.len(),
            completed,
            remaining: self.remaining_tasks().len(),
            failed: count(TaskStatus::Failed),
            skipped: count(TaskStatus::Skipped),
            duration_secs: (self.checkpoint_at - self.started_at).num_seconds().max(0) as u64,
        }
    }

    /// Stamp `checkpoint_at` and write atomically
    pub fn save(&mut self, store: &CheckpointStore, path: &Path) -> ExecResult<()> {
        debug!(run_id = %self.run_id, path = %path.display(), "AgentCheckpoint::save: called");
        self.checkpoint_at = Utc::now();
        store.save(path, self)?;
        Ok(())
    }

    pub fn load(store: &CheckpointStore, path: &Path) -> ExecResult<Self> {
        debug!(path = %path.display(), "AgentCheckpoint::load: called");
        let checkpoint: Self = store.load(path)?;
        checkpoint.validate(path)?;
        Ok(checkpoint)
    }
}

/// Counts shown by `cv status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub completed: usize,
    pub remaining: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_secs: u64,
}

impl std::fmt::Display for ProgressSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} completed, {} remaining, {} failed, {} skipped ({}s)",
            self.completed, self.total, self.remaining, self.failed, self.skipped, self.duration_secs
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn abc() -> AgentCheckpoint {
        let tasks = vec![
            Task::new("A", "first").with_target("a.py"),
            Task::new("B", "second").with_depends_on(["A"]),
            Task::new("C", "third").with_depends_on(["B"]),
        ];
        AgentCheckpoint::new(
            "run-1",
            "build abc",
            tasks,
            "/tmp/work",
            TaskExecutionConfig::default(),
            ParallelConfig::default(),
        )
    }

    fn remaining_ids(cp: &AgentCheckpoint) -> Vec<String> {
        cp.remaining_tasks().iter().map(|t| t.id.clone()).collect()
    }

    #[test]
    fn test_update_task_tracks_completion_and_artifacts() {
        let mut cp = abc();
        let mut a = cp.task("A").cloned().unwrap();
        a.mark_running();
        a.mark_completed();
        cp.update_task(a.clone());
        cp.update_task(a);

        assert_eq!(cp.completed_ids, vec!["A"]);
        assert_eq!(cp.artifacts, vec![PathBuf::from("a.py")]);
        assert_eq!(remaining_ids(&cp), vec!["B", "C"]);
    }

    #[test]
    fn test_save_load_preserves_remaining() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let path = temp.path().join("wave-000.json");

        let mut cp = abc();
        cp.completed_ids.push("A".to_string());
        assert_eq!(remaining_ids(&cp), vec!["B", "C"]);

        cp.save(&store, &path).unwrap();
        let loaded = AgentCheckpoint::load(&store, &path).unwrap();
        assert_eq!(remaining_ids(&loaded), vec!["B", "C"]);
        assert_eq!(loaded, cp);
    }

    #[test]
    fn test_unknown_completed_id_is_corrupt() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let path = temp.path().join("wave-000.json");

        let mut cp = abc();
        cp.completed_ids.push("Z".to_string());
        store.save(&path, &cp).unwrap();

        let err = AgentCheckpoint::load(&store, &path).unwrap_err();
        assert!(matches!(err, ExecError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_missing_fields_are_corrupt() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let path = temp.path().join("wave-000.json");
        std::fs::write(&path, r#"{"goal": "x"}"#).unwrap();

        let err = AgentCheckpoint::load(&store, &path).unwrap_err();
        assert!(matches!(err, ExecError::CheckpointCorrupt { .. }));
    }

    #[test]
    fn test_progress_summary() {
        let mut cp = abc();
        let mut a = cp.task("A").cloned().unwrap();
        a.mark_completed();
        cp.update_task(a);
        let mut b = cp.task("B").cloned().unwrap();
        b.mark_failed("lint");
        cp.update_task(b);
        let mut c = cp.task("C").cloned().unwrap();
        c.mark_skipped("dependency B failed");
        cp.update_task(c);

        let summary = cp.progress_summary();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.skipped, 1);
        // failed tasks stay resumable
        assert_eq!(summary.remaining, 1);
        assert!(summary.to_string().starts_with("1/3 completed"));
    }
}
