//! Convergent - execution core for an autonomous coding agent
//!
//! Given a goal, Convergent discovers a dependency graph of artifacts, runs
//! it wave by wave under bounded parallelism, validates every output through
//! an escalating cascade of gates, and repairs failures until the artifact set
//! stabilizes or the run escalates to a human.
//!
//! # Architecture
//!
//! ```text
//!   goal ──▶ Discoverer ──▶ ArtifactGraph ──▶ execution_waves()
//!                                                  │
//!                      ┌───────────────────────────┘
//!                      ▼
//!          ParallelExecutionCoordinator  (task slots + write slots)
//!                      │
//!                      ▼
//!      TaskRunner ──▶ Workspace (FileLockManager) ──▶ files on disk
//!                      │
//!                      ▼
//!               ConvergenceLoop ──▶ GateCascade ──▶ TieredJudge
//!                      │                 ▲
//!                      └── Oracle fix ───┘
//!
//!   after every wave: CheckpointWriter ──▶ run-*/wave-NNN.json
//! ```
//!
//! The language model is reached only through the [`oracle::Oracle`] trait.

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod convergence;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod events;
pub mod gate;
pub mod graph;
pub mod oracle;
pub mod run;
pub mod workspace;

pub use checkpoint::{AgentCheckpoint, CheckpointWriter, ProgressSummary};
pub use config::Config;
pub use convergence::{ConvergenceConfig, ConvergenceLoop, ConvergenceResult, ConvergenceStatus};
pub use coordinator::{FailurePolicy, ParallelConfig, ParallelExecutionCoordinator, TaskExecutionConfig};
pub use domain::{ArtifactSpec, Task, TaskMode, TaskStatus};
pub use error::{ExecError, ExecResult};
pub use events::{Event, EventBus, EventHook};
pub use gate::{GateCascade, GateResult, GateType, TieredJudge, ValidationGate};
pub use graph::{ArtifactGraph, Discoverer};
pub use oracle::{Oracle, OracleError};
pub use run::{RunContext, RunOutcome, RunStatus, Runner};
pub use workspace::Workspace;
