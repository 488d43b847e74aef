//! RunStore - crash-safe run state on the local file system
//!
//! Two concerns live here, both synchronous and free of any async runtime:
//!
//! - **Checkpoints**: JSON documents written with write-temp, fsync, rename so a
//!   reader never observes a half-written file.
//! - **Locks**: advisory, OS-level locks on one lock file per target path,
//!   acquired in a global order so that multi-file acquisition cannot deadlock.
//!
//! # Layout
//!
//! ```text
//! {checkpoint_root}/
//! └── run-20260114-093012/
//!     ├── wave-000.json
//!     ├── wave-001.json
//!     └── events.jsonl
//!
//! {lock_dir}/
//! └── %2Fhome%2Fdev%2Fproj%2Fsrc%2Fmain.rs.lock
//! ```
//!
//! # Example
//!
//! ```ignore
//! use runstore::{CheckpointStore, FileLockManager};
//! use std::time::Duration;
//!
//! let locks = FileLockManager::new("/tmp/locks")?;
//! let _held = locks.acquire_all(["src/a.rs", "src/b.rs"], Duration::from_secs(5))?;
//!
//! let store = CheckpointStore::open(".convergent/checkpoints")?;
//! let run_dir = store.create_run(chrono::Utc::now())?;
//! store.save(&CheckpointStore::wave_path(&run_dir, 0), &state)?;
//! ```

mod checkpoint;
mod error;
mod locks;

pub use checkpoint::{CheckpointStore, atomic_write};
pub use error::{CheckpointError, LockError};
pub use locks::{FileLock, FileLockManager, LockConfig, LockSet, normalize_path};

/// Extension used for lock files
pub const LOCK_EXTENSION: &str = "lock";

/// Default age after which an unheld lock file is considered stale (10 minutes)
pub const DEFAULT_STALE_AFTER_SECS: u64 = 600;
