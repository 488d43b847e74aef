//! Execution error taxonomy
//!
//! Every expected failure of the execution core is one of these variants.
//! Callers decide what to do with [`ExecError::is_fatal`] and
//! [`ExecError::is_transient`]; panics are reserved for broken invariants.

use std::path::PathBuf;
use std::time::Duration;

use runstore::{CheckpointError, LockError};
use thiserror::Error;

use crate::gate::GateType;
use crate::oracle::OracleError;

pub type ExecResult<T> = Result<T, ExecError>;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Discovery failed after {attempts} attempts: {reason}")]
    DiscoveryFailed { attempts: u32, reason: String },

    #[error("Discovery produced {count} artifacts, limit is {limit}")]
    GraphExplosion { count: usize, limit: usize },

    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Invalid artifact graph: {0}")]
    InvalidGraph(String),

    #[error("{gate_type} gate failed: {}", errors.first().map(String::as_str).unwrap_or("no details"))]
    Validation { gate_type: GateType, errors: Vec<String> },

    #[error("Timed out after {waited:?} waiting for lock on {}", path.display())]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("Convergence timed out after {iterations} iterations ({elapsed:?})")]
    ConvergenceTimeout { iterations: u32, elapsed: Duration },

    #[error("Convergence escalated after {iterations} iterations: {reason}")]
    ConvergenceEscalated { iterations: u32, reason: String },

    #[error("Checkpoint {} is corrupt: {reason}", path.display())]
    CheckpointCorrupt { path: PathBuf, reason: String },

    #[error("Oracle error: {0}")]
    Oracle(#[from] OracleError),

    #[error("Unit {unit} panicked: {message}")]
    Panicked { unit: String, message: String },

    #[error("Run aborted: {reason}")]
    Aborted { reason: String, checkpoint: Option<PathBuf> },

    #[error("I/O error ({context}): {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ExecError::Io {
            context: context.into(),
            source,
        }
    }

    /// Structural failures that no retry or repair can fix
    pub fn is_fatal(&self) -> bool {
        match self {
            ExecError::GraphExplosion { .. } | ExecError::CyclicDependency { .. } | ExecError::Aborted { .. } => true,
            ExecError::Oracle(e) => !e.is_transient(),
            _ => false,
        }
    }

    /// Failures worth retrying locally with backoff
    pub fn is_transient(&self) -> bool {
        match self {
            ExecError::LockTimeout { .. } => true,
            ExecError::Oracle(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<LockError> for ExecError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Timeout { path, waited } => ExecError::LockTimeout { path, waited },
            LockError::Io { path, source } => ExecError::io(format!("lock {}", path.display()), source),
        }
    }
}

impl From<CheckpointError> for ExecError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Corrupt { path, reason } => ExecError::CheckpointCorrupt { path, reason },
            CheckpointError::Io { path, source } => ExecError::io(format!("checkpoint {}", path.display()), source),
            other => ExecError::io("checkpoint", std::io::Error::other(other.to_string())),
        }
    }
}
