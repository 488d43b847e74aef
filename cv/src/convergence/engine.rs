//! ConvergenceLoop - validate, repair, repeat until stable or out of budget

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ConvergenceConfig;
use super::signature::failure_signature;
use crate::error::{ExecError, ExecResult};
use crate::events::{Event, EventEmitter};
use crate::gate::{GateCascade, GateResult};
use crate::oracle::{ErrorContext, Oracle, OracleError, Patch};
use crate::run::CancelToken;
use crate::workspace::Workspace;

/// Loop state; every finished loop is in one of the last three
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceStatus {
    Running,
    Stable,
    Escalated,
    Timeout,
}

impl std::fmt::Display for ConvergenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stable => write!(f, "stable"),
            Self::Escalated => write!(f, "escalated"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// One validation pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceIteration {
    pub iteration: u32,
    pub gate_results: Vec<GateResult>,
    pub files: Vec<PathBuf>,
    pub all_passed: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvergenceResult {
    pub status: ConvergenceStatus,
    pub iterations: Vec<ConvergenceIteration>,
    pub iteration_count: u32,
    pub duration_ms: u64,
    pub tokens_used: u64,
    pub reason: String,
}

impl ConvergenceResult {
    pub fn is_stable(&self) -> bool {
        self.status == ConvergenceStatus::Stable
    }

    /// Non-stable endings as the matching error
    pub fn into_result(self) -> ExecResult<ConvergenceResult> {
        match self.status {
            ConvergenceStatus::Stable => Ok(self),
            ConvergenceStatus::Timeout => Err(ExecError::ConvergenceTimeout {
                iterations: self.iteration_count,
                elapsed: Duration::from_millis(self.duration_ms),
            }),
            ConvergenceStatus::Escalated | ConvergenceStatus::Running => Err(ExecError::ConvergenceEscalated {
                iterations: self.iteration_count,
                reason: self.reason,
            }),
        }
    }
}

/// Drives one file set to a state where every enabled gate passes
pub struct ConvergenceLoop {
    config: ConvergenceConfig,
    cascade: Arc<GateCascade>,
    oracle: Arc<dyn Oracle>,
    workspace: Arc<Workspace>,
    events: EventEmitter,
    cancel: CancelToken,
}

/// Mutable bookkeeping for one `run`
struct LoopState {
    started: Instant,
    iterations: Vec<ConvergenceIteration>,
    seen: HashMap<String, u32>,
    tokens_used: u64,
}

enum RepairOutcome {
    Applied,
    /// Nothing changed this round; re-validate anyway
    Skipped,
    Finished(ConvergenceStatus, String),
}

impl ConvergenceLoop {
    pub fn new(
        config: ConvergenceConfig,
        cascade: Arc<GateCascade>,
        oracle: Arc<dyn Oracle>,
        workspace: Arc<Workspace>,
        events: EventEmitter,
    ) -> Self {
        Self {
            config,
            cascade,
            oracle,
            workspace,
            events,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &ConvergenceConfig {
        &self.config
    }

    /// Validate `files`, repairing through the Oracle until stable
    ///
    /// Never errors: every way of stopping is a status with a reason.
    pub async fn run(&self, files: &[PathBuf], contract: &str) -> ConvergenceResult {
        debug!(files = files.len(), "ConvergenceLoop::run: called");
        let mut state = LoopState {
            started: Instant::now(),
            iterations: Vec::new(),
            seen: HashMap::new(),
            tokens_used: 0,
        };
        let mut tracked: Vec<PathBuf> = files.to_vec();

        self.events.emit(Event::ConvergenceStarted {
            run_id: self.events.run_id().to_string(),
            task_id: self.events.task_id().to_string(),
            max_iterations: self.config.max_iterations,
        });

        let mut iteration = 0u32;
        // a pass after a repair that never landed revalidates the same content
        let mut repair_landed = true;
        loop {
            if self.cancel.is_cancelled() {
                return self.finish(state, ConvergenceStatus::Timeout, "run cancelled".to_string());
            }
            iteration += 1;
            self.events.emit(Event::ConvergenceIterationStarted {
                run_id: self.events.run_id().to_string(),
                task_id: self.events.task_id().to_string(),
                iteration,
            });

            let pass_started = Instant::now();
            let snapshot = match self.workspace.snapshot(&tracked).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    return self.finish(state, ConvergenceStatus::Escalated, format!("cannot read files: {}", e));
                }
            };
            let report = tokio::select! {
                report = self.cascade.run(&snapshot, contract, Some(&self.events)) => report,
                _ = self.cancel.cancelled() => {
                    return self.finish(state, ConvergenceStatus::Timeout, "run cancelled".to_string());
                }
            };

            let all_passed = report.passed();
            let failing_gates: Vec<String> = report
                .results
                .iter()
                .filter(|r| !r.is_pass())
                .map(|r| r.gate_id.clone())
                .collect();
            self.events.emit(Event::ConvergenceIterationCompleted {
                run_id: self.events.run_id().to_string(),
                task_id: self.events.task_id().to_string(),
                iteration,
                all_passed,
                failing_gates: failing_gates.clone(),
            });
            state.iterations.push(ConvergenceIteration {
                iteration,
                gate_results: report.results.clone(),
                files: tracked.clone(),
                all_passed,
                duration_ms: pass_started.elapsed().as_millis() as u64,
            });

            if all_passed {
                info!(iteration, "ConvergenceLoop: stable");
                return self.finish(state, ConvergenceStatus::Stable, format!("all gates passed after {} iteration(s)", iteration));
            }

            // once per pass, however many lines share a signature
            let signatures: BTreeSet<String> = report
                .failures()
                .flat_map(|r| r.errors.iter().map(|e| failure_signature(r.gate_type, e)))
                .collect();
            if repair_landed {
                for signature in &signatures {
                    *state.seen.entry(signature.clone()).or_default() += 1;
                }
            }

            if iteration >= self.config.max_iterations {
                let reason = format!(
                    "still failing ({}) after {} iterations",
                    failing_gates.join(", "),
                    iteration
                );
                return self.finish(state, ConvergenceStatus::Escalated, reason);
            }
            if state.started.elapsed() >= self.config.timeout() {
                let reason = format!("timed out after {}s", self.config.timeout_seconds);
                return self.finish(state, ConvergenceStatus::Timeout, reason);
            }
            if let Some(stuck) = signatures
                .iter()
                .find(|s| state.seen.get(*s).copied().unwrap_or(0) >= self.config.escalate_after_same_error)
            {
                let reason = format!(
                    "same error repeated {} times: {}",
                    self.config.escalate_after_same_error, stuck
                );
                return self.finish(state, ConvergenceStatus::Escalated, reason);
            }
            if self.config.max_tokens > 0 && state.tokens_used >= self.config.max_tokens {
                let reason = format!(
                    "token budget exhausted ({} of {})",
                    state.tokens_used, self.config.max_tokens
                );
                return self.finish(state, ConvergenceStatus::Escalated, reason);
            }

            self.events.emit(Event::ConvergenceFixing {
                run_id: self.events.run_id().to_string(),
                task_id: self.events.task_id().to_string(),
                iteration,
                failure_count: report.failures().count(),
            });
            let context = ErrorContext {
                iteration,
                contract: contract.to_string(),
                files: snapshot,
                failures: report.to_failure_reports(),
            };

            match self.repair(&context, &mut state, &mut tracked).await {
                RepairOutcome::Applied => repair_landed = true,
                RepairOutcome::Skipped => repair_landed = false,
                RepairOutcome::Finished(status, reason) => return self.finish(state, status, reason),
            }

            if self.config.debounce_ms > 0 {
                tokio::time::sleep(self.config.debounce()).await;
            }
        }
    }

    async fn repair(&self, context: &ErrorContext, state: &mut LoopState, tracked: &mut Vec<PathBuf>) -> RepairOutcome {
        let remaining = self.config.timeout().saturating_sub(state.started.elapsed());
        let patch: Result<Patch, OracleError> = tokio::select! {
            outcome = tokio::time::timeout(remaining, self.oracle.generate_fix(context)) => match outcome {
                Ok(patch) => patch,
                Err(_) => {
                    return RepairOutcome::Finished(
                        ConvergenceStatus::Timeout,
                        format!("timed out after {}s waiting for a repair", self.config.timeout_seconds),
                    );
                }
            },
            _ = self.cancel.cancelled() => {
                return RepairOutcome::Finished(ConvergenceStatus::Timeout, "run cancelled".to_string());
            }
        };

        let patch = match patch {
            Ok(patch) => patch,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "ConvergenceLoop: repair failed transiently, re-validating");
                return RepairOutcome::Skipped;
            }
            Err(e) => {
                return RepairOutcome::Finished(ConvergenceStatus::Escalated, format!("oracle cannot repair: {}", e));
            }
        };

        state.tokens_used += patch.usage.total();
        if patch.is_empty() {
            return RepairOutcome::Finished(
                ConvergenceStatus::Escalated,
                "oracle proposed no changes".to_string(),
            );
        }

        debug!(edits = patch.edits.len(), "ConvergenceLoop: applying repair");
        if let Err(e) = self.workspace.apply(&patch.edits).await {
            if e.is_transient() {
                warn!(error = %e, "ConvergenceLoop: could not apply repair, re-validating");
                return RepairOutcome::Skipped;
            }
            return RepairOutcome::Finished(ConvergenceStatus::Escalated, format!("cannot apply repair: {}", e));
        }
        for edit in &patch.edits {
            if !tracked.contains(&edit.path) {
                tracked.push(edit.path.clone());
            }
        }
        RepairOutcome::Applied
    }

    fn finish(&self, state: LoopState, status: ConvergenceStatus, reason: String) -> ConvergenceResult {
        let iteration_count = state.iterations.len() as u32;
        let duration_ms = state.started.elapsed().as_millis() as u64;
        let run_id = self.events.run_id().to_string();
        let task_id = self.events.task_id().to_string();

        match status {
            ConvergenceStatus::Stable => self.events.emit(Event::ConvergenceStable {
                run_id,
                task_id,
                iterations: iteration_count,
            }),
            ConvergenceStatus::Timeout => {
                warn!(iteration_count, %reason, "ConvergenceLoop: timeout");
                self.events.emit(Event::ConvergenceTimeout {
                    run_id,
                    task_id,
                    iterations: iteration_count,
                    elapsed_ms: duration_ms,
                })
            }
            ConvergenceStatus::Escalated | ConvergenceStatus::Running => {
                warn!(iteration_count, %reason, "ConvergenceLoop: escalated");
                self.events.emit(Event::ConvergenceEscalated {
                    run_id,
                    task_id,
                    iterations: iteration_count,
                    reason: reason.clone(),
                })
            }
        }

        ConvergenceResult {
            status,
            iterations: state.iterations,
            iteration_count,
            duration_ms,
            tokens_used: state.tokens_used,
            reason,
        }
    }
}
