//! Error types for run state storage

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors from acquiring or releasing file locks
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    Timeout { path: PathBuf, waited: Duration },

    #[error("Lock I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    /// Contention that may clear up if the caller tries again later
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Timeout { .. })
    }

    /// Target path the error refers to
    pub fn path(&self) -> &PathBuf {
        match self {
            LockError::Timeout { path, .. } | LockError::Io { path, .. } => path,
        }
    }
}

/// Errors from reading or writing checkpoint files
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Checkpoint I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Checkpoint {} is corrupt: {reason}", path.display())]
    Corrupt { path: PathBuf, reason: String },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid checkpoint search pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl CheckpointError {
    /// Build a corrupt-checkpoint error for a file whose contents fail validation
    pub fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        CheckpointError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// A corrupt file can be skipped in favour of an older checkpoint or a fresh run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CheckpointError::Corrupt { .. })
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}
