//! Execution and parallelism policy

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// What the run does when a task fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Mark the task failed, skip its dependents, keep going
    #[default]
    Continue,
    /// Re-run with backoff, then behave like `Continue`
    Retry,
    /// Checkpoint and stop
    Abort,
    /// Discard the remaining waves and rediscover
    Replan,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Retry => write!(f, "retry"),
            Self::Abort => write!(f, "abort"),
            Self::Replan => write!(f, "replan"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "continue" => Ok(Self::Continue),
            "retry" => Ok(Self::Retry),
            "abort" => Ok(Self::Abort),
            "replan" => Ok(Self::Replan),
            _ => Err(format!(
                "Unknown failure policy: {}. Use continue, retry, abort or replan",
                s
            )),
        }
    }
}

/// Task-level execution settings, persisted with each checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskExecutionConfig {
    #[serde(rename = "failure-policy")]
    pub failure_policy: FailurePolicy,

    #[serde(rename = "max-retries-per-task")]
    pub max_retries_per_task: u32,

    #[serde(rename = "retry-backoff-seconds")]
    pub retry_backoff_seconds: f64,

    /// Periodic checkpoint while a wave runs
    #[serde(rename = "checkpoint-interval-seconds")]
    pub checkpoint_interval_seconds: u64,

    #[serde(rename = "max-replans")]
    pub max_replans: u32,
}

impl Default for TaskExecutionConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::Continue,
            max_retries_per_task: 2,
            retry_backoff_seconds: 1.0,
            checkpoint_interval_seconds: 60,
            max_replans: 1,
        }
    }
}

impl TaskExecutionConfig {
    /// Delay before retry `attempt` (1-based): base * 2^(attempt-1)
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.saturating_sub(1).min(16) as i32);
        Duration::from_secs_f64((self.retry_backoff_seconds * factor).max(0.0))
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_seconds.max(1))
    }
}

/// Concurrency limits for one wave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub enabled: bool,

    #[serde(rename = "max-parallel-tasks")]
    pub max_parallel_tasks: usize,

    /// File-mutating sections allowed at once
    #[serde(rename = "max-parallel-writes")]
    pub max_parallel_writes: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_parallel_tasks: 8,
            max_parallel_writes: 2,
        }
    }
}
