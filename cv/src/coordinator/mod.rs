//! ParallelExecutionCoordinator - bounded concurrency for one wave
//!
//! Units of a wave run as tokio tasks behind a worker semaphore. A separate
//! write-slot semaphore, shared with the workspace, bounds how many units
//! mutate files at once. Results come back in submission order; a failing or
//! panicking unit never cancels its siblings.

mod policy;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::{ExecError, ExecResult};

pub use policy::{FailurePolicy, ParallelConfig, TaskExecutionConfig};

/// Outcome of one unit, tagged with its id
#[derive(Debug)]
pub struct UnitResult<T> {
    pub id: String,
    pub outcome: ExecResult<T>,
}

impl<T> UnitResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct ParallelExecutionCoordinator {
    config: ParallelConfig,
    worker_count: usize,
    workers: Arc<Semaphore>,
    write_slots: Arc<Semaphore>,
}

impl ParallelExecutionCoordinator {
    pub fn new(config: ParallelConfig) -> Self {
        let worker_count = worker_count(&config);
        let writes = config.max_parallel_writes.max(1);
        debug!(worker_count, writes, "ParallelExecutionCoordinator::new: called");
        Self {
            config,
            worker_count,
            workers: Arc::new(Semaphore::new(worker_count)),
            write_slots: Arc::new(Semaphore::new(writes)),
        }
    }

    pub fn config(&self) -> &ParallelConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Semaphore every file-mutating section must hold a permit of
    pub fn write_slots(&self) -> Arc<Semaphore> {
        self.write_slots.clone()
    }

    /// Run every unit, at most `worker_count` at a time
    pub async fn execute<T, Fut>(&self, units: Vec<(String, Fut)>) -> Vec<UnitResult<T>>
    where
        T: Send + 'static,
        Fut: Future<Output = ExecResult<T>> + Send + 'static,
    {
        debug!(units = units.len(), workers = self.worker_count, "ParallelExecutionCoordinator::execute: called");
        let mut handles = Vec::with_capacity(units.len());
        for (id, unit) in units {
            let workers = self.workers.clone();
            let handle = tokio::spawn(async move {
                let _permit = workers
                    .acquire_owned()
                    .await
                    .map_err(|e| ExecError::io("worker pool", std::io::Error::other(e)))?;
                unit.await
            });
            handles.push((id, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    let message = panic_message(e);
                    warn!(unit = %id, %message, "ParallelExecutionCoordinator: unit panicked");
                    Err(ExecError::Panicked {
                        unit: id.clone(),
                        message,
                    })
                }
            };
            results.push(UnitResult { id, outcome });
        }
        results
    }
}

fn worker_count(config: &ParallelConfig) -> usize {
    if !config.enabled {
        return 1;
    }
    let detected = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    detected.clamp(1, config.max_parallel_tasks.max(1))
}

fn panic_message(err: tokio::task::JoinError) -> String {
    if err.is_cancelled() {
        return "cancelled".to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
