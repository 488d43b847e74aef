//! Oracle error types

use std::time::Duration;
use thiserror::Error;

/// Errors returned by an Oracle
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Oracle process exited with {code}: {message}")]
    Process { code: i32, message: String },

    #[error("Oracle unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Oracle I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Prompt template error: {0}")]
    Template(String),
}

impl OracleError {
    /// Retrying the same request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            OracleError::RateLimited { .. } => true,
            OracleError::Timeout(_) => true,
            // 126/127: command not executable / not found
            OracleError::Process { code, .. } => !matches!(code, 126 | 127),
            OracleError::Io(_) => true,
            OracleError::Unavailable(_) => false,
            OracleError::InvalidResponse(_) => false,
            OracleError::Template(_) => false,
        }
    }

    /// Server-requested delay before the next attempt
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OracleError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}
