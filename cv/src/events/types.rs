//! Event types for run observability
//!
//! These events describe everything observable about a run:
//! - Run lifecycle (start, complete)
//! - Discovery (attempts, resulting graph)
//! - Waves and tasks
//! - Gates and judge tiers
//! - Convergence iterations and terminal states
//! - Checkpoints

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::gate::{GateStatus, GateType, JudgeTier};

/// Core event enum - the vocabulary of run activity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    // === Run Lifecycle ===
    RunStarted {
        run_id: String,
        goal: String,
        resumed: bool,
    },
    RunCompleted {
        run_id: String,
        status: String,
        completed: usize,
        failed: usize,
        skipped: usize,
        reason: String,
    },

    // === Discovery ===
    DiscoveryStarted {
        run_id: String,
        goal: String,
    },
    /// One Oracle round-trip; `error` is set when the answer was rejected
    DiscoveryAttempt {
        run_id: String,
        attempt: u32,
        error: Option<String>,
    },
    DiscoveryCompleted {
        run_id: String,
        artifacts: usize,
        waves: usize,
    },

    // === Waves & Tasks ===
    WaveStarted {
        run_id: String,
        wave: usize,
        task_ids: Vec<String>,
    },
    WaveCompleted {
        run_id: String,
        wave: usize,
        completed: usize,
        failed: usize,
    },
    TaskStarted {
        run_id: String,
        task_id: String,
        mode: String,
        attempt: u32,
    },
    TaskCompleted {
        run_id: String,
        task_id: String,
        success: bool,
        error: Option<String>,
    },
    TaskSkipped {
        run_id: String,
        task_id: String,
        reason: String,
    },

    // === Gates ===
    GateCompleted {
        run_id: String,
        task_id: String,
        gate_id: String,
        gate_type: GateType,
        status: GateStatus,
        error_count: usize,
        duration_ms: u64,
    },
    JudgeDecided {
        run_id: String,
        task_id: String,
        gate_id: String,
        tier: JudgeTier,
        score: f32,
        passed: bool,
    },

    // === Convergence ===
    ConvergenceStarted {
        run_id: String,
        task_id: String,
        max_iterations: u32,
    },
    ConvergenceIterationStarted {
        run_id: String,
        task_id: String,
        iteration: u32,
    },
    ConvergenceIterationCompleted {
        run_id: String,
        task_id: String,
        iteration: u32,
        all_passed: bool,
        failing_gates: Vec<String>,
    },
    ConvergenceFixing {
        run_id: String,
        task_id: String,
        iteration: u32,
        failure_count: usize,
    },
    ConvergenceStable {
        run_id: String,
        task_id: String,
        iterations: u32,
    },
    ConvergenceEscalated {
        run_id: String,
        task_id: String,
        iterations: u32,
        reason: String,
    },
    ConvergenceTimeout {
        run_id: String,
        task_id: String,
        iterations: u32,
        elapsed_ms: u64,
    },

    // === Persistence ===
    CheckpointSaved {
        run_id: String,
        path: String,
        completed: usize,
        total: usize,
    },

    // === Warnings ===
    Warning {
        run_id: String,
        context: String,
        message: String,
    },
}

impl Event {
    /// Run this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            Event::RunStarted { run_id, .. }
            | Event::RunCompleted { run_id, .. }
            | Event::DiscoveryStarted { run_id, .. }
            | Event::DiscoveryAttempt { run_id, .. }
            | Event::DiscoveryCompleted { run_id, .. }
            | Event::WaveStarted { run_id, .. }
            | Event::WaveCompleted { run_id, .. }
            | Event::TaskStarted { run_id, .. }
            | Event::TaskCompleted { run_id, .. }
            | Event::TaskSkipped { run_id, .. }
            | Event::GateCompleted { run_id, .. }
            | Event::JudgeDecided { run_id, .. }
            | Event::ConvergenceStarted { run_id, .. }
            | Event::ConvergenceIterationStarted { run_id, .. }
            | Event::ConvergenceIterationCompleted { run_id, .. }
            | Event::ConvergenceFixing { run_id, .. }
            | Event::ConvergenceStable { run_id, .. }
            | Event::ConvergenceEscalated { run_id, .. }
            | Event::ConvergenceTimeout { run_id, .. }
            | Event::CheckpointSaved { run_id, .. }
            | Event::Warning { run_id, .. } => run_id,
        }
    }

    /// Event kind name, as passed to hooks
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RunStarted { .. } => "RunStarted",
            Event::RunCompleted { .. } => "RunCompleted",
            Event::DiscoveryStarted { .. } => "DiscoveryStarted",
            Event::DiscoveryAttempt { .. } => "DiscoveryAttempt",
            Event::DiscoveryCompleted { .. } => "DiscoveryCompleted",
            Event::WaveStarted { .. } => "WaveStarted",
            Event::WaveCompleted { .. } => "WaveCompleted",
            Event::TaskStarted { .. } => "TaskStarted",
            Event::TaskCompleted { .. } => "TaskCompleted",
            Event::TaskSkipped { .. } => "TaskSkipped",
            Event::GateCompleted { .. } => "GateCompleted",
            Event::JudgeDecided { .. } => "JudgeDecided",
            Event::ConvergenceStarted { .. } => "ConvergenceStarted",
            Event::ConvergenceIterationStarted { .. } => "ConvergenceIterationStarted",
            Event::ConvergenceIterationCompleted { .. } => "ConvergenceIterationCompleted",
            Event::ConvergenceFixing { .. } => "ConvergenceFixing",
            Event::ConvergenceStable { .. } => "ConvergenceStable",
            Event::ConvergenceEscalated { .. } => "ConvergenceEscalated",
            Event::ConvergenceTimeout { .. } => "ConvergenceTimeout",
            Event::CheckpointSaved { .. } => "CheckpointSaved",
            Event::Warning { .. } => "Warning",
        }
    }
}

/// A timestamped event log entry for file persistence
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventLogEntry {
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    pub event: Event,
}

impl EventLogEntry {
    pub fn new(event: Event) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_run_id_and_kind() {
        let event = Event::ConvergenceStable {
            run_id: "run-1".to_string(),
            task_id: "api".to_string(),
            iterations: 2,
        };
        assert_eq!(event.run_id(), "run-1");
        assert_eq!(event.kind(), "ConvergenceStable");
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = Event::GateCompleted {
            run_id: "run-1".to_string(),
            task_id: "api".to_string(),
            gate_id: "lint".to_string(),
            gate_type: GateType::Lint,
            status: GateStatus::Failed,
            error_count: 3,
            duration_ms: 12,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "GateCompleted");
        assert_eq!(json["gate_type"], "lint");
        assert_eq!(json["status"], "failed");

        let parsed: Event = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.run_id(), "run-1");
    }

    #[test]
    fn test_event_log_entry() {
        let entry = EventLogEntry::new(Event::Warning {
            run_id: "r".to_string(),
            context: "discovery".to_string(),
            message: "orphan artifact".to_string(),
        });
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"ts\""));
        assert!(json.contains("Warning"));
    }
}
