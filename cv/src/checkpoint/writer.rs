//! CheckpointWriter - actor that owns the live checkpoint of one run
//!
//! Task updates are sent as commands; the actor is the only writer of the
//! run's checkpoint files. It saves after every wave (on request) and on a
//! fixed interval whenever something changed since the last save.

use std::path::{Path, PathBuf};
use std::time::Duration;

use runstore::CheckpointStore;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::AgentCheckpoint;
use crate::domain::Task;
use crate::error::{ExecError, ExecResult};
use crate::events::{Event, EventEmitter};

enum WriterCommand {
    UpdateTask(Task),
    ReplaceTasks(Vec<Task>),
    SetContext(String, serde_json::Value),
    SaveWave {
        wave: usize,
        reply: oneshot::Sender<ExecResult<PathBuf>>,
    },
    Shutdown {
        reply: oneshot::Sender<ExecResult<Option<PathBuf>>>,
    },
}

/// Handle to the checkpoint actor
#[derive(Clone)]
pub struct CheckpointWriter {
    tx: mpsc::Sender<WriterCommand>,
}

impl CheckpointWriter {
    /// Spawn the actor; wave files continue after any already in `run_dir`
    pub fn spawn(
        store: CheckpointStore,
        run_dir: PathBuf,
        checkpoint: AgentCheckpoint,
        emitter: EventEmitter,
        interval: Duration,
    ) -> Self {
        debug!(run_dir = %run_dir.display(), ?interval, "CheckpointWriter::spawn: called");
        let (tx, rx) = mpsc::channel(256);
        let next_wave = next_wave_index(&run_dir);
        let actor = WriterActor {
            store,
            run_dir: run_dir.clone(),
            checkpoint,
            emitter,
            dirty: false,
            next_wave,
            last_path: None,
        };
        tokio::spawn(actor.run(rx, interval));
        info!(run_dir = %run_dir.display(), next_wave, "CheckpointWriter spawned");
        Self { tx }
    }

    pub async fn update_task(&self, task: Task) -> ExecResult<()> {
        debug!(task_id = %task.id, status = %task.status, "CheckpointWriter::update_task: called");
        self.send(WriterCommand::UpdateTask(task)).await
    }

    /// Swap in a new task list (after replanning)
    pub async fn replace_tasks(&self, tasks: Vec<Task>) -> ExecResult<()> {
        debug!(count = tasks.len(), "CheckpointWriter::replace_tasks: called");
        self.send(WriterCommand::ReplaceTasks(tasks)).await
    }

    pub async fn set_context(&self, key: impl Into<String>, value: serde_json::Value) -> ExecResult<()> {
        self.send(WriterCommand::SetContext(key.into(), value)).await
    }

    /// Persist the state reached at the end of `wave`
    pub async fn save_wave(&self, wave: usize) -> ExecResult<PathBuf> {
        debug!(wave, "CheckpointWriter::save_wave: called");
        let (reply, rx) = oneshot::channel();
        self.send(WriterCommand::SaveWave { wave, reply }).await?;
        rx.await.map_err(|_| closed())?
    }

    /// Flush pending changes and stop; returns the last checkpoint written
    pub async fn shutdown(&self) -> ExecResult<Option<PathBuf>> {
        debug!("CheckpointWriter::shutdown: called");
        let (reply, rx) = oneshot::channel();
        self.send(WriterCommand::Shutdown { reply }).await?;
        rx.await.map_err(|_| closed())?
    }

    async fn send(&self, cmd: WriterCommand) -> ExecResult<()> {
        self.tx.send(cmd).await.map_err(|_| closed())
    }
}

fn closed() -> ExecError {
    ExecError::io("checkpoint writer", std::io::Error::other("writer stopped"))
}

/// First wave number not yet used by a file in `run_dir`
fn next_wave_index(run_dir: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(run_dir) else {
        return 0;
    };
    entries
        .flatten()
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_prefix("wave-")?.strip_suffix(".json")?.parse::<usize>().ok()
        })
        .map(|n| n + 1)
        .max()
        .unwrap_or(0)
}

struct WriterActor {
    store: CheckpointStore,
    run_dir: PathBuf,
    checkpoint: AgentCheckpoint,
    emitter: EventEmitter,
    dirty: bool,
    next_wave: usize,
    last_path: Option<PathBuf>,
}

impl WriterActor {
    async fn run(mut self, mut rx: mpsc::Receiver<WriterCommand>, interval: Duration) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else {
                        // every handle dropped
                        self.flush();
                        break;
                    };
                    if self.handle(cmd) {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.dirty {
                        debug!("WriterActor: interval checkpoint");
                        self.flush();
                    }
                }
            }
        }
        debug!("WriterActor: stopped");
    }

    /// Returns true when the actor should stop
    fn handle(&mut self, cmd: WriterCommand) -> bool {
        match cmd {
            WriterCommand::UpdateTask(task) => {
                self.checkpoint.update_task(task);
                self.dirty = true;
            }
            WriterCommand::ReplaceTasks(tasks) => {
                let completed = std::mem::take(&mut self.checkpoint.completed_ids);
                self.checkpoint.tasks = tasks;
                self.checkpoint.completed_ids = completed
                    .into_iter()
                    .filter(|id| self.checkpoint.tasks.iter().any(|t| &t.id == id))
                    .collect();
                self.dirty = true;
            }
            WriterCommand::SetContext(key, value) => {
                self.checkpoint.context.insert(key, value);
                self.dirty = true;
            }
            WriterCommand::SaveWave { wave, reply } => {
                let wave = wave.max(self.next_wave);
                let path = CheckpointStore::wave_path(&self.run_dir, wave);
                let result = self.save(&path).map(|_| path);
                if result.is_ok() {
                    self.next_wave = wave + 1;
                }
                let _ = reply.send(result);
            }
            WriterCommand::Shutdown { reply } => {
                let result = if self.dirty || self.last_path.is_none() {
                    let path = CheckpointStore::wave_path(&self.run_dir, self.next_wave);
                    self.save(&path).map(|_| Some(path))
                } else {
                    Ok(self.last_path.clone())
                };
                let _ = reply.send(result);
                return true;
            }
        }
        false
    }

    /// Interval and drop saves go to the file of the wave in progress
    fn flush(&mut self) {
        let path = CheckpointStore::wave_path(&self.run_dir, self.next_wave);
        if let Err(e) = self.save(&path) {
            warn!(error = %e, path = %path.display(), "WriterActor: checkpoint save failed");
            self.emitter.warning("checkpoint", e.to_string());
        }
    }

    fn save(&mut self, path: &Path) -> ExecResult<()> {
        self.checkpoint.save(&self.store, path)?;
        self.dirty = false;
        self.last_path = Some(path.to_path_buf());
        let summary = self.checkpoint.progress_summary();
        info!(path = %path.display(), completed = summary.completed, total = summary.total, "Checkpoint saved");
        self.emitter.emit(Event::CheckpointSaved {
            run_id: self.checkpoint.run_id.clone(),
            path: path.display().to_string(),
            completed: summary.completed,
            total: summary.total,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ParallelConfig, TaskExecutionConfig};
    use tempfile::tempdir;

    fn checkpoint() -> AgentCheckpoint {
        AgentCheckpoint::new(
            "run-1",
            "goal",
            vec![Task::new("A", "a"), Task::new("B", "b").with_depends_on(["A"])],
            "/tmp",
            TaskExecutionConfig::default(),
            ParallelConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_save_wave_writes_numbered_files() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let run_dir = store.create_run(chrono::Utc::now()).unwrap();
        let writer = CheckpointWriter::spawn(
            store.clone(),
            run_dir.clone(),
            checkpoint(),
            EventEmitter::detached("run-1"),
            Duration::from_secs(60),
        );

        let mut a = Task::new("A", "a");
        a.mark_completed();
        writer.update_task(a).await.unwrap();
        let first = writer.save_wave(0).await.unwrap();
        let second = writer.save_wave(1).await.unwrap();

        assert!(first.ends_with("wave-000.json"));
        assert!(second.ends_with("wave-001.json"));

        let loaded = AgentCheckpoint::load(&store, &second).unwrap();
        assert_eq!(loaded.completed_ids, vec!["A"]);
        assert_eq!(store.latest().unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_resumed_writer_continues_numbering() {
        let temp = tempdir().unwrap();
        let run_dir = temp.path().join("run-x");
        std::fs::create_dir_all(&run_dir).unwrap();
        std::fs::write(run_dir.join("wave-000.json"), "{}").unwrap();
        std::fs::write(run_dir.join("wave-001.json"), "{}").unwrap();
        assert_eq!(next_wave_index(&run_dir), 2);

        let store = CheckpointStore::open(temp.path()).unwrap();
        let writer = CheckpointWriter::spawn(
            store,
            run_dir,
            checkpoint(),
            EventEmitter::detached("run-1"),
            Duration::from_secs(60),
        );
        let path = writer.save_wave(0).await.unwrap();
        assert!(path.ends_with("wave-002.json"));
    }

    #[tokio::test]
    async fn test_interval_save_when_dirty() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let run_dir = store.create_run(chrono::Utc::now()).unwrap();
        let writer = CheckpointWriter::spawn(
            store.clone(),
            run_dir.clone(),
            checkpoint(),
            EventEmitter::detached("run-1"),
            Duration::from_millis(50),
        );

        writer.set_context("note", serde_json::json!("hello")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let path = CheckpointStore::wave_path(&run_dir, 0);
        let loaded = AgentCheckpoint::load(&store, &path).unwrap();
        assert_eq!(loaded.context.get("note"), Some(&serde_json::json!("hello")));
    }

    #[tokio::test]
    async fn test_shutdown_flushes_and_stops() {
        let temp = tempdir().unwrap();
        let store = CheckpointStore::open(temp.path()).unwrap();
        let run_dir = store.create_run(chrono::Utc::now()).unwrap();
        let writer = CheckpointWriter::spawn(
            store,
            run_dir,
            checkpoint(),
            EventEmitter::detached("run-1"),
            Duration::from_secs(60),
        );

        let path = writer.shutdown().await.unwrap();
        assert!(path.unwrap().exists());
        assert!(writer.save_wave(5).await.is_err());
    }
}
