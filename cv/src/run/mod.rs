//! Run orchestration
//!
//! A [`Runner`] turns a goal into an artifact graph, executes its waves in
//! order through the [`crate::coordinator::ParallelExecutionCoordinator`], applies the
//! failure policy, and checkpoints after every wave so the run can resume.

mod cancel;
mod context;
mod runner;
mod task_runner;

pub use cancel::CancelToken;
pub use context::{RunContext, RunSettings};
pub use runner::{EVENT_LOG_FILE, RunOutcome, RunStatus, Runner};
pub use task_runner::{TaskReport, TaskRunner, target_of};
