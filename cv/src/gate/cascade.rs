//! Gate cascade - runs gates cheapest-first with fail-fast blocking

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tracing::{debug, info, warn};

use super::judge::TieredJudge;
use super::structural;
use super::validators::{check_assertion, run_command};
use super::{GateCriterion, GateResult, GateType, ValidationGate};
use crate::error::{ExecError, ExecResult};
use crate::events::{Event, EventEmitter};
use crate::graph::layer_waves;
use crate::oracle::{FailureReport, FileSnapshot};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const RETRY_BACKOFF_MS: u64 = 200;

/// Executes one gate; shared by every cascade of a run
pub struct GateRunner {
    working_dir: PathBuf,
    command_timeout: Duration,
    /// Builtin command per gate type
    commands: HashMap<GateType, String>,
    judge: Option<Arc<TieredJudge>>,
    retries: u32,
}

impl GateRunner {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            commands: HashMap::new(),
            judge: None,
            retries: 1,
        }
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Command a builtin gate of this type runs
    pub fn with_command(mut self, gate_type: GateType, command: impl Into<String>) -> Self {
        self.commands.insert(gate_type, command.into());
        self
    }

    pub fn with_judge(mut self, judge: Arc<TieredJudge>) -> Self {
        self.judge = Some(judge);
        self
    }

    /// Extra attempts after a transient validator failure
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Run a single gate; never errors, failures are in the result
    pub async fn run_gate(&self, gate: &ValidationGate, files: &[FileSnapshot], contract: &str) -> GateResult {
        debug!(gate_id = %gate.id, gate_type = %gate.gate_type, "GateRunner::run_gate: called");
        let start = Instant::now();

        let mut result = match (&gate.criterion, gate.gate_type) {
            (GateCriterion::Command(command), _) => self.command_gate(gate, command, files).await,
            (GateCriterion::Assertion(assertion), _) => {
                let (passed, errors) = check_assertion(assertion, files);
                if passed {
                    GateResult::passed(gate)
                } else {
                    GateResult::failed(gate, errors)
                }
            }
            (GateCriterion::Builtin, GateType::Syntax) => {
                let report = structural::check_files(files);
                let mut result = if report.passed() {
                    GateResult::passed(gate)
                } else {
                    GateResult::failed(gate, report.hard)
                };
                result.warnings = report.soft;
                result
            }
            (GateCriterion::Builtin, GateType::Import | GateType::Lint | GateType::Type | GateType::Test) => {
                match self.commands.get(&gate.gate_type) {
                    Some(command) => self.command_gate(gate, command, files).await,
                    None => GateResult::skipped(gate, format!("no {} command configured", gate.gate_type)),
                }
            }
            (GateCriterion::Builtin, GateType::Semantic) => match &self.judge {
                Some(judge) => self.semantic_gate(gate, judge, files, contract).await,
                None => GateResult::skipped(gate, "no judge configured"),
            },
        };

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn command_gate(&self, gate: &ValidationGate, command: &str, files: &[FileSnapshot]) -> GateResult {
        let mut attempt = 0;
        loop {
            match run_command(command, files, &self.working_dir, self.command_timeout).await {
                Ok(output) if output.success() => return GateResult::passed(gate),
                Ok(output) if output.tool_missing() => {
                    warn!(gate_id = %gate.id, %command, "Validator tool not found, skipping gate");
                    return GateResult::skipped(gate, format!("tool not found for `{}`", command));
                }
                Ok(output) => return GateResult::failed(gate, output.error_lines()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(gate_id = %gate.id, attempt, error = %e, "Validator failed to run, retrying");
                    tokio::time::sleep(backoff(attempt)).await;
                }
                Err(e) => return GateResult::failed(gate, vec![format!("validator error: {}", e)]),
            }
        }
    }

    async fn semantic_gate(
        &self,
        gate: &ValidationGate,
        judge: &TieredJudge,
        files: &[FileSnapshot],
        contract: &str,
    ) -> GateResult {
        let mut attempt = 0;
        loop {
            match judge.evaluate(contract, files).await {
                Ok(verdict) => {
                    let mut result = if verdict.passed {
                        GateResult::passed(gate)
                    } else {
                        let mut errors = verdict.issues.clone();
                        if errors.is_empty() {
                            errors.push(format!(
                                "{:?} with score {:.1} from the {} tier",
                                verdict.verdict, verdict.score, verdict.tier
                            ));
                        }
                        GateResult::failed(gate, errors)
                    };
                    if verdict.passed {
                        result.warnings = verdict.issues;
                    }
                    result.score = verdict.score;
                    result.confidence = verdict.confidence;
                    result.tier = Some(verdict.tier);
                    return result;
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    attempt += 1;
                    warn!(gate_id = %gate.id, attempt, error = %e, "Judge failed, retrying");
                    tokio::time::sleep(e.retry_after().unwrap_or_else(|| backoff(attempt))).await;
                }
                Err(e) => return GateResult::failed(gate, vec![format!("judge error: {}", e)]),
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(RETRY_BACKOFF_MS * 2u64.pow(attempt.saturating_sub(1).min(6)))
}

/// Results of one cascade pass, in execution order
#[derive(Debug, Clone, Default)]
pub struct CascadeReport {
    pub results: Vec<GateResult>,
}

impl CascadeReport {
    /// Every gate passed or was skipped
    pub fn passed(&self) -> bool {
        self.results.iter().all(GateResult::is_pass)
    }

    /// Gates that ran and failed
    pub fn failures(&self) -> impl Iterator<Item = &GateResult> {
        self.results.iter().filter(|r| r.is_failure())
    }

    pub fn get(&self, gate_id: &str) -> Option<&GateResult> {
        self.results.iter().find(|r| r.gate_id == gate_id)
    }

    /// Failing gates as handed to the Oracle for repair
    pub fn to_failure_reports(&self) -> Vec<FailureReport> {
        self.failures()
            .map(|r| FailureReport {
                gate_id: r.gate_id.clone(),
                gate_type: r.gate_type.as_str().to_string(),
                errors: r.errors.clone(),
            })
            .collect()
    }
}

/// Ordered set of gates over one file set
pub struct GateCascade {
    gates: Vec<ValidationGate>,
    /// Gate indices per layer
    layers: Vec<Vec<usize>>,
    runner: Arc<GateRunner>,
}

impl GateCascade {
    /// Validate the gate dependencies and precompute the layers
    pub fn new(gates: Vec<ValidationGate>, runner: Arc<GateRunner>) -> ExecResult<Self> {
        let mut index = HashMap::new();
        for (i, gate) in gates.iter().enumerate() {
            if index.insert(gate.id.clone(), i).is_some() {
                return Err(ExecError::InvalidGraph(format!("duplicate gate id `{}`", gate.id)));
            }
        }
        for gate in &gates {
            if let Some(missing) = gate.requires.iter().find(|r| !index.contains_key(*r)) {
                return Err(ExecError::InvalidGraph(format!(
                    "gate `{}` requires unknown gate `{}`",
                    gate.id, missing
                )));
            }
        }

        let layers = layer_waves(gates.iter().map(|g| (g.id.as_str(), g.requires.as_slice())))?
            .into_iter()
            .map(|layer| layer.iter().filter_map(|id| index.get(id).copied()).collect())
            .collect();

        Ok(Self { gates, layers, runner })
    }

    pub fn gates(&self) -> &[ValidationGate] {
        &self.gates
    }

    pub fn is_empty(&self) -> bool {
        self.gates.is_empty()
    }

    /// Run every gate once
    ///
    /// Gates in one layer run concurrently. A gate whose required gates did
    /// not all pass is recorded as blocked without running.
    pub async fn run(&self, files: &[FileSnapshot], contract: &str, events: Option<&EventEmitter>) -> CascadeReport {
        debug!(gates = self.gates.len(), files = files.len(), "GateCascade::run: called");
        let mut report = CascadeReport::default();
        let mut passed: HashSet<&str> = HashSet::new();

        for layer in &self.layers {
            let mut runnable = Vec::new();
            for &i in layer {
                let gate = &self.gates[i];
                let blocked_by: Vec<String> = gate
                    .requires
                    .iter()
                    .filter(|r| !passed.contains(r.as_str()))
                    .cloned()
                    .collect();
                if blocked_by.is_empty() {
                    runnable.push(gate);
                } else {
                    debug!(gate_id = %gate.id, ?blocked_by, "GateCascade: gate blocked");
                    let result = GateResult::blocked(gate, &blocked_by);
                    emit_gate(events, &result);
                    report.results.push(result);
                }
            }

            let results = join_all(runnable.iter().map(|gate| self.runner.run_gate(gate, files, contract))).await;
            for (gate, result) in runnable.into_iter().zip(results) {
                if result.is_pass() {
                    passed.insert(gate.id.as_str());
                } else {
                    info!(gate_id = %gate.id, errors = result.errors.len(), "GateCascade: gate failed");
                }
                emit_gate(events, &result);
                report.results.push(result);
            }
        }

        report
    }
}

fn emit_gate(events: Option<&EventEmitter>, result: &GateResult) {
    let Some(events) = events else {
        return;
    };
    events.emit(Event::GateCompleted {
        run_id: events.run_id().to_string(),
        task_id: events.task_id().to_string(),
        gate_id: result.gate_id.clone(),
        gate_type: result.gate_type,
        status: result.status,
        error_count: result.errors.len(),
        duration_ms: result.duration_ms,
    });
    if let Some(tier) = result.tier {
        events.emit(Event::JudgeDecided {
            run_id: events.run_id().to_string(),
            task_id: events.task_id().to_string(),
            gate_id: result.gate_id.clone(),
            tier,
            score: result.score,
            passed: result.is_pass(),
        });
    }
}
