//! Advisory multi-file locking
//!
//! Every target path maps to exactly one lock file inside the lock directory.
//! Holding the OS-level exclusive lock on that file is holding the target.
//! Multi-target acquisition sorts targets by their normalized path first, so
//! any two acquirers take overlapping locks in the same order and cannot wait
//! on each other in a cycle.

use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;
use log::{debug, info, warn};
use rand::Rng;

use crate::error::LockError;
use crate::{DEFAULT_STALE_AFTER_SECS, LOCK_EXTENSION};

/// Longest lock file name we produce before falling back to a hashed suffix
const MAX_LOCK_NAME_LEN: usize = 200;

/// Tunables for lock acquisition
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Directory holding the lock files
    pub lock_dir: PathBuf,

    /// Age after which an unheld lock file may be reaped
    pub stale_after: Duration,

    /// First retry delay while a lock is contended
    pub initial_backoff: Duration,

    /// Upper bound on the retry delay
    pub max_backoff: Duration,
}

impl LockConfig {
    pub fn new(lock_dir: impl Into<PathBuf>) -> Self {
        Self {
            lock_dir: lock_dir.into(),
            stale_after: Duration::from_secs(DEFAULT_STALE_AFTER_SECS),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(500),
        }
    }
}

/// Hands out exclusive [`FileLock`]s on arbitrary target paths
#[derive(Debug, Clone)]
pub struct FileLockManager {
    config: LockConfig,
}

impl FileLockManager {
    /// Create a manager with default tunables, creating the lock directory if needed
    pub fn new(lock_dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        Self::with_config(LockConfig::new(lock_dir))
    }

    pub fn with_config(config: LockConfig) -> Result<Self, LockError> {
        debug!("FileLockManager::with_config: lock_dir={}", config.lock_dir.display());
        fs::create_dir_all(&config.lock_dir).map_err(|source| LockError::Io {
            path: config.lock_dir.clone(),
            source,
        })?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Lock file that guards `target`
    pub fn lock_path_for(&self, target: &Path) -> PathBuf {
        let normalized = normalize_path(target);
        self.config.lock_dir.join(lock_file_name(&normalized))
    }

    /// Block until `target` is exclusively held or `timeout` elapses
    pub fn acquire(&self, target: impl AsRef<Path>, timeout: Duration) -> Result<FileLock, LockError> {
        let started = Instant::now();
        self.acquire_until(&normalize_path(target.as_ref()), started + timeout, started)
    }

    /// Acquire every target, in global order, against a single deadline
    ///
    /// Duplicates (after normalization) are held once. If any acquisition
    /// fails, the locks taken so far are released before the error returns.
    pub fn acquire_all<I, P>(&self, targets: I, timeout: Duration) -> Result<LockSet, LockError>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let started = Instant::now();
        let deadline = started + timeout;

        // BTreeMap gives the sort and the dedup in one pass
        let ordered: BTreeMap<PathBuf, ()> = targets
            .into_iter()
            .map(|p| (normalize_path(p.as_ref()), ()))
            .collect();
        debug!("FileLockManager::acquire_all: {} targets", ordered.len());

        let mut held = LockSet::default();
        for target in ordered.into_keys() {
            match self.acquire_until(&target, deadline, started) {
                Ok(lock) => held.locks.push(lock),
                Err(e) => {
                    warn!(
                        "FileLockManager::acquire_all: failed on {} after {} held, releasing",
                        target.display(),
                        held.len()
                    );
                    held.release_all();
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Remove every stale, unheld lock file in the lock directory
    ///
    /// Returns the number of files removed.
    pub fn reap_stale(&self) -> Result<usize, LockError> {
        let entries = fs::read_dir(&self.config.lock_dir).map_err(|source| LockError::Io {
            path: self.config.lock_dir.clone(),
            source,
        })?;

        let mut reaped = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOCK_EXTENSION) {
                continue;
            }
            if self.reap_if_stale(&path) {
                reaped += 1;
            }
        }
        info!("FileLockManager::reap_stale: removed {} stale lock files", reaped);
        Ok(reaped)
    }

    fn acquire_until(&self, target: &Path, deadline: Instant, started: Instant) -> Result<FileLock, LockError> {
        let lock_path = self.config.lock_dir.join(lock_file_name(target));
        let mut backoff = self.config.initial_backoff;
        let mut rng = rand::rng();

        loop {
            self.reap_if_stale(&lock_path);

            if let Some(handle) = try_lock(&lock_path).map_err(|source| LockError::Io {
                path: target.to_path_buf(),
                source,
            })? {
                debug!("FileLockManager: acquired {}", target.display());
                return Ok(FileLock {
                    target: target.to_path_buf(),
                    lock_path,
                    handle: Some(handle),
                });
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LockError::Timeout {
                    path: target.to_path_buf(),
                    waited: now.duration_since(started),
                });
            }

            let jitter_ms = rng.random_range(0..=(backoff.as_millis() as u64 / 2));
            let pause = (backoff + Duration::from_millis(jitter_ms)).min(deadline - now);
            thread::sleep(pause);
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// A lock file is stale when it is old and nobody holds it
    fn reap_if_stale(&self, lock_path: &Path) -> bool {
        let Ok(meta) = fs::metadata(lock_path) else {
            return false;
        };
        let age = meta.modified().ok().and_then(|m| m.elapsed().ok()).unwrap_or_default();
        if age < self.config.stale_after {
            return false;
        }

        let Ok(file) = OpenOptions::new().read(true).write(true).open(lock_path) else {
            return false;
        };
        if FileExt::try_lock_exclusive(&file).is_err() {
            return false;
        }

        let removed = fs::remove_file(lock_path).is_ok();
        let _ = FileExt::unlock(&file);
        if removed {
            warn!("Reaped stale lock file {} (age {:?})", lock_path.display(), age);
        }
        removed
    }
}

/// Exclusive hold on one target path
///
/// Released by [`FileLock::release`] or on drop, whichever comes first.
#[derive(Debug)]
pub struct FileLock {
    target: PathBuf,
    lock_path: PathBuf,
    handle: Option<File>,
}

impl FileLock {
    /// Normalized path this lock guards
    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn is_held(&self) -> bool {
        self.handle.is_some()
    }

    /// Give the lock up; calling this more than once is a no-op
    pub fn release(&mut self) {
        if let Some(file) = self.handle.take() {
            // Unlink before unlocking so a waiter on the old inode notices and reopens
            let _ = fs::remove_file(&self.lock_path);
            if let Err(e) = FileExt::unlock(&file) {
                warn!("Failed to unlock {}: {}", self.lock_path.display(), e);
            }
            debug!("FileLock: released {}", self.target.display());
        }
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        self.release();
    }
}

/// Locks taken together by [`FileLockManager::acquire_all`]
#[derive(Debug, Default)]
pub struct LockSet {
    locks: Vec<FileLock>,
}

impl LockSet {
    pub fn len(&self) -> usize {
        self.locks.iter().filter(|l| l.is_held()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Normalized targets in acquisition order
    pub fn targets(&self) -> Vec<&Path> {
        self.locks.iter().map(|l| l.target()).collect()
    }

    /// Release in reverse acquisition order; idempotent
    pub fn release_all(&mut self) {
        while let Some(mut lock) = self.locks.pop() {
            lock.release();
        }
    }
}

impl Drop for LockSet {
    fn drop(&mut self) {
        self.release_all();
    }
}

/// Absolute, lexically cleaned form of a path
///
/// Does not touch the file system, so targets that do not exist yet
/// normalize the same way as ones that do.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(path)
    };

    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Flatten a normalized path into a single reversible file name
fn lock_file_name(normalized: &Path) -> String {
    let raw = normalized.to_string_lossy();
    let mut name = String::with_capacity(raw.len() + 8);
    for ch in raw.chars() {
        match ch {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            ':' => name.push_str("%3A"),
            c => name.push(c),
        }
    }

    if name.len() > MAX_LOCK_NAME_LEN {
        let mut hasher = DefaultHasher::new();
        raw.hash(&mut hasher);
        let tail: String = name
            .chars()
            .rev()
            .take(MAX_LOCK_NAME_LEN - 20)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        name = format!("{:016x}-{}", hasher.finish(), tail);
    }

    format!("{}.{}", name, LOCK_EXTENSION)
}

/// Non-blocking attempt on one lock file
///
/// `Ok(None)` means somebody else holds it, or it was unlinked underneath us.
fn try_lock(lock_path: &Path) -> io::Result<Option<File>> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(lock_path)?;

    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {}
        Err(e) if is_contended(&e) => return Ok(None),
        Err(e) => return Err(e),
    }

    if !still_linked(&file, lock_path) {
        let _ = FileExt::unlock(&file);
        return Ok(None);
    }

    // Holder stamp; also refreshes mtime for stale detection
    file.set_len(0)?;
    writeln!(file, "{} {}", std::process::id(), chrono::Utc::now().to_rfc3339())?;
    Ok(Some(file))
}

fn is_contended(e: &io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// The handle we locked is still the file at `lock_path`
#[cfg(unix)]
fn still_linked(file: &File, lock_path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), fs::metadata(lock_path)) {
        (Ok(held), Ok(on_disk)) => held.dev() == on_disk.dev() && held.ino() == on_disk.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn still_linked(_file: &File, lock_path: &Path) -> bool {
    lock_path.exists()
}
