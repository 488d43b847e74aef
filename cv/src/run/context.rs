//! RunContext - everything one run shares across its tasks

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use runstore::{CheckpointStore, FileLockManager};
use tracing::debug;

use super::CancelToken;
use crate::convergence::ConvergenceConfig;
use crate::coordinator::{ParallelConfig, ParallelExecutionCoordinator, TaskExecutionConfig};
use crate::events::EventBus;
use crate::gate::{GateRunner, ValidationGate};
use crate::graph::DiscoveryConfig;
use crate::oracle::{GenerateOptions, Oracle, PromptLibrary};
use crate::workspace::Workspace;

/// Tunables of a run, usually taken from [`crate::Config`]
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub discovery: DiscoveryConfig,
    pub convergence: ConvergenceConfig,
    pub execution: TaskExecutionConfig,
    pub parallel: ParallelConfig,
    /// Options for artifact generation calls
    pub generate: GenerateOptions,
    pub lock_timeout: Duration,
    /// Append the run's events to `events.jsonl` in its checkpoint directory
    pub record_events: bool,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            convergence: ConvergenceConfig::default(),
            execution: TaskExecutionConfig::default(),
            parallel: ParallelConfig::default(),
            generate: GenerateOptions::default(),
            lock_timeout: Duration::from_secs(30),
            record_events: true,
        }
    }
}

/// Run-scoped owner of the Oracle, event bus, locks and workspace cache
pub struct RunContext {
    pub oracle: Arc<dyn Oracle>,
    pub prompts: Arc<PromptLibrary>,
    pub bus: Arc<EventBus>,
    pub locks: Arc<FileLockManager>,
    pub workspace: Arc<Workspace>,
    pub coordinator: Arc<ParallelExecutionCoordinator>,
    pub gate_runner: Arc<GateRunner>,
    /// Extra gates on top of the builtin chain; gates with `after_tasks` run once per run
    pub gates: Vec<ValidationGate>,
    pub store: CheckpointStore,
    pub cancel: CancelToken,
    pub settings: RunSettings,
}

impl RunContext {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        oracle: Arc<dyn Oracle>,
        locks: Arc<FileLockManager>,
        store: CheckpointStore,
        settings: RunSettings,
    ) -> Self {
        let working_dir = working_dir.into();
        debug!(working_dir = %working_dir.display(), "RunContext::new: called");
        let coordinator = Arc::new(ParallelExecutionCoordinator::new(settings.parallel.clone()));
        let workspace = Arc::new(Workspace::new(
            working_dir.clone(),
            locks.clone(),
            settings.lock_timeout,
            coordinator.write_slots(),
        ));
        Self {
            oracle,
            prompts: Arc::new(PromptLibrary::embedded()),
            bus: Arc::new(EventBus::with_default_capacity()),
            locks,
            workspace,
            coordinator,
            gate_runner: Arc::new(GateRunner::new(working_dir)),
            gates: Vec::new(),
            store,
            cancel: CancelToken::new(),
            settings,
        }
    }

    pub fn with_prompts(mut self, prompts: Arc<PromptLibrary>) -> Self {
        self.prompts = prompts;
        self
    }

    pub fn with_gate_runner(mut self, runner: GateRunner) -> Self {
        self.gate_runner = Arc::new(runner);
        self
    }

    pub fn with_gates(mut self, gates: Vec<ValidationGate>) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn working_dir(&self) -> &Path {
        self.workspace.root()
    }
}
