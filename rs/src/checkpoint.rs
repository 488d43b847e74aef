//! Atomic JSON checkpoint files
//!
//! A checkpoint is written to a uniquely named temp file in the destination
//! directory, flushed to disk, and renamed over the target. Rename within one
//! directory is atomic, so readers see either the old file or the new one.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CheckpointError;

/// Prefix of run directories under the checkpoint root
const RUN_PREFIX: &str = "run-";

/// Write `bytes` to `path` so that no reader ever sees a partial file
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "checkpoint".to_string());
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::now_v7()));

    let written = (|| -> std::io::Result<()> {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(bytes)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)?;
        sync_dir(&dir);
        Ok(())
    })();

    if let Err(e) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(CheckpointError::io(path, e));
    }
    debug!("atomic_write: {} ({} bytes)", path.display(), bytes.len());
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("Failed to fsync directory {}: {}", dir.display(), e);
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

/// Directory of per-run checkpoint files
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    /// Open (creating if needed) a checkpoint root
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CheckpointError::io(&root, e))?;
        debug!("CheckpointStore::open: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the directory for a new run, named after its start time
    pub fn create_run(&self, started_at: DateTime<Utc>) -> Result<PathBuf, CheckpointError> {
        let base = format!("{}{}", RUN_PREFIX, started_at.format("%Y%m%d-%H%M%S"));
        let mut dir = self.root.join(&base);
        let mut suffix = 1;
        while dir.exists() {
            dir = self.root.join(format!("{}-{}", base, suffix));
            suffix += 1;
        }
        fs::create_dir_all(&dir).map_err(|e| CheckpointError::io(&dir, e))?;
        info!("CheckpointStore: created run directory {}", dir.display());
        Ok(dir)
    }

    /// File name for the checkpoint taken after `wave`
    pub fn wave_path(run_dir: &Path, wave: usize) -> PathBuf {
        run_dir.join(format!("wave-{:03}.json", wave))
    }

    /// Serialize and atomically write a checkpoint
    pub fn save<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        atomic_write(path, &bytes)
    }

    /// Read a checkpoint; unparsable content is reported as corrupt
    pub fn load<T: DeserializeOwned>(&self, path: &Path) -> Result<T, CheckpointError> {
        let content = fs::read(path).map_err(|e| CheckpointError::io(path, e))?;
        serde_json::from_slice(&content).map_err(|e| CheckpointError::corrupt(path, e.to_string()))
    }

    /// Run directories, oldest first
    pub fn list_runs(&self) -> Result<Vec<PathBuf>, CheckpointError> {
        let pattern = format!("{}/{}*", self.root.display(), RUN_PREFIX);
        let mut runs: Vec<PathBuf> = glob::glob(&pattern)?.flatten().filter(|p| p.is_dir()).collect();
        runs.sort_by_key(|p| (modified(p), p.clone()));
        Ok(runs)
    }

    /// Most recently written checkpoint in one run directory
    pub fn latest_in(&self, run_dir: &Path) -> Result<Option<PathBuf>, CheckpointError> {
        let pattern = format!("{}/*.json", run_dir.display());
        let latest = glob::glob(&pattern)?
            .flatten()
            .filter(|p| p.is_file())
            .max_by_key(|p| (modified(p), p.clone()));
        Ok(latest)
    }

    /// Resume target: the newest checkpoint of the newest run that has one
    pub fn latest(&self) -> Result<Option<PathBuf>, CheckpointError> {
        for run in self.list_runs()?.iter().rev() {
            if let Some(path) = self.latest_in(run)? {
                debug!("CheckpointStore::latest: {}", path.display());
                return Ok(Some(path));
            }
        }
        Ok(None)
    }
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}
