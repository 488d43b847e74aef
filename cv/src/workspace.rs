//! Workspace - the files a run reads and writes
//!
//! Reads go through a per-run content cache. Writes take a write slot, lock
//! every target through the [`FileLockManager`], and land atomically, so a
//! concurrent reader sees either the old or the new file.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use runstore::{FileLockManager, LockSet, atomic_write};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::{ExecError, ExecResult};
use crate::oracle::{FileEdit, FileSnapshot};

/// Root directory plus the run's locks, write slots and cache
pub struct Workspace {
    root: PathBuf,
    locks: Arc<FileLockManager>,
    lock_timeout: Duration,
    write_slots: Arc<Semaphore>,
    cache: Mutex<HashMap<PathBuf, String>>,
}

impl Workspace {
    pub fn new(
        root: impl Into<PathBuf>,
        locks: Arc<FileLockManager>,
        lock_timeout: Duration,
        write_slots: Arc<Semaphore>,
    ) -> Self {
        Self {
            root: root.into(),
            locks,
            lock_timeout,
            write_slots,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn locks(&self) -> &Arc<FileLockManager> {
        &self.locks
    }

    /// Absolute location of a workspace-relative path
    ///
    /// Paths that climb out of the root are refused.
    pub fn resolve(&self, path: &Path) -> ExecResult<PathBuf> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root).map_err(|_| escape_error(path))?
        } else {
            path
        };
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            return Err(escape_error(path));
        }
        Ok(self.root.join(relative))
    }

    pub async fn exists(&self, path: &Path) -> bool {
        match self.resolve(path) {
            Ok(full) => tokio::fs::try_exists(full).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// File content, `None` when the file does not exist
    pub async fn read(&self, path: &Path) -> ExecResult<Option<String>> {
        let full = self.resolve(path)?;
        if let Some(content) = self.cached(&full) {
            return Ok(Some(content));
        }
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => {
                self.remember(full, &content);
                Ok(Some(content))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ExecError::io(format!("read {}", full.display()), e)),
        }
    }

    /// Snapshots for the gates; a missing file appears with empty content
    pub async fn snapshot(&self, paths: &[PathBuf]) -> ExecResult<Vec<FileSnapshot>> {
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let content = self.read(path).await?.unwrap_or_default();
            files.push(FileSnapshot {
                path: path.clone(),
                content,
            });
        }
        Ok(files)
    }

    /// Write one file under lock
    pub async fn write(&self, path: &Path, content: &str) -> ExecResult<()> {
        self.apply(&[FileEdit {
            path: path.to_path_buf(),
            content: content.to_string(),
        }])
        .await
    }

    /// Apply a set of whole-file edits under a write slot and file locks
    pub async fn apply(&self, edits: &[FileEdit]) -> ExecResult<()> {
        if edits.is_empty() {
            return Ok(());
        }
        let targets: Vec<(PathBuf, String)> = edits
            .iter()
            .map(|e| Ok((self.resolve(&e.path)?, e.content.clone())))
            .collect::<ExecResult<_>>()?;
        debug!(count = targets.len(), "Workspace::apply: called");

        let _slot = self
            .write_slots
            .acquire()
            .await
            .map_err(|e| ExecError::io("write slots", std::io::Error::other(e)))?;
        let mut held = self.lock_all(targets.iter().map(|(p, _)| p.clone()).collect()).await?;

        let written = targets.clone();
        let outcome = tokio::task::spawn_blocking(move || -> ExecResult<()> {
            for (path, content) in &written {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent).map_err(|e| ExecError::io(format!("create {}", parent.display()), e))?;
                }
                atomic_write(path, content.as_bytes())?;
            }
            Ok(())
        })
        .await
        .map_err(|e| ExecError::io("write task", std::io::Error::other(e)));

        // A partial failure leaves disk state unknown, so drop the entries
        match &outcome {
            Ok(Ok(())) => {
                for (path, content) in targets {
                    self.remember(path, &content);
                }
            }
            _ => {
                for (path, _) in &targets {
                    self.forget(path);
                }
            }
        }
        held.release_all();
        outcome?
    }

    /// Drop a cached entry, e.g. after an external tool touched the file
    pub fn invalidate(&self, path: &Path) {
        if let Ok(full) = self.resolve(path) {
            self.forget(&full);
        }
    }

    async fn lock_all(&self, targets: Vec<PathBuf>) -> ExecResult<LockSet> {
        let locks = self.locks.clone();
        let timeout = self.lock_timeout;
        let held = tokio::task::spawn_blocking(move || locks.acquire_all(targets, timeout))
            .await
            .map_err(|e| ExecError::io("lock task", std::io::Error::other(e)))??;
        Ok(held)
    }

    fn cached(&self, full: &Path) -> Option<String> {
        match self.cache.lock() {
            Ok(cache) => cache.get(full).cloned(),
            Err(poisoned) => poisoned.into_inner().get(full).cloned(),
        }
    }

    fn remember(&self, full: PathBuf, content: &str) {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.insert(full, content.to_string());
    }

    fn forget(&self, full: &Path) {
        let mut cache = match self.cache.lock() {
            Ok(c) => c,
            Err(poisoned) => poisoned.into_inner(),
        };
        cache.remove(full);
    }
}

fn escape_error(path: &Path) -> ExecError {
    ExecError::io(
        format!("resolve {}", path.display()),
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "path escapes the workspace"),
    )
}
