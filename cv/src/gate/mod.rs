//! Validation gates
//!
//! A gate is one typed check over a set of files. Gates form a small
//! dependency graph of their own (`requires`), and the [`GateCascade`] runs
//! them cheapest-first: a gate only runs once every gate it requires passed.
//!
//! ```text
//!   Syntax ──▶ Import ──▶ Lint ──┐
//!                     └─▶ Type ──┴─▶ Test ──▶ Semantic
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

mod cascade;
mod judge;
mod structural;
mod validators;

pub use cascade::{CascadeReport, GateCascade, GateRunner};
pub use judge::{Judge, JudgeConfig, JudgeRequest, JudgeTier, Judgment, OracleJudge, TieredJudge, TieredVerdict, Verdict};
pub use structural::{StructuralReport, check_files as structural_check};
pub use validators::{CommandOutput, check_assertion, run_command};

/// Closed set of gate kinds, in escalating cost order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateType {
    Syntax,
    Import,
    Lint,
    Type,
    Test,
    Semantic,
}

impl GateType {
    pub const ALL: [GateType; 6] = [
        GateType::Syntax,
        GateType::Import,
        GateType::Lint,
        GateType::Type,
        GateType::Test,
        GateType::Semantic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Syntax => "syntax",
            Self::Import => "import",
            Self::Lint => "lint",
            Self::Type => "type",
            Self::Test => "test",
            Self::Semantic => "semantic",
        }
    }

    /// Escalation tier; gates in the same tier are independent of each other
    pub fn tier(&self) -> u8 {
        match self {
            Self::Syntax => 0,
            Self::Import => 1,
            Self::Lint | Self::Type => 2,
            Self::Test => 3,
            Self::Semantic => 4,
        }
    }
}

impl std::fmt::Display for GateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for GateType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GateType::ALL
            .into_iter()
            .find(|g| g.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("Unknown gate type: {}. Use syntax, import, lint, type, test or semantic", s))
    }
}

/// Content assertion evaluated without running anything
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Assertion {
    Contains(String),
    NotContains(String),
    Matches(String),
}

/// What decides whether a gate passes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GateCriterion {
    /// Built-in behaviour for the gate type
    #[default]
    Builtin,
    /// Shell command; exit 0 passes. `{files}` expands to the file list
    Command(String),
    Assertion(Assertion),
}

/// One check in the cascade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationGate {
    pub id: String,

    pub gate_type: GateType,

    /// Tasks that must be complete before this gate is meaningful
    #[serde(default)]
    pub after_tasks: Vec<String>,

    /// Gate ids that must pass before this one runs
    #[serde(default)]
    pub requires: Vec<String>,

    /// Nested enums read as plain maps in YAML, e.g. `{assertion: {contains: ...}}`
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub criterion: GateCriterion,
}

impl ValidationGate {
    pub fn new(id: impl Into<String>, gate_type: GateType) -> Self {
        Self {
            id: id.into(),
            gate_type,
            after_tasks: Vec::new(),
            requires: Vec::new(),
            criterion: GateCriterion::Builtin,
        }
    }

    /// Builtin gate named after its type
    pub fn builtin(gate_type: GateType) -> Self {
        Self::new(gate_type.as_str(), gate_type)
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.criterion = GateCriterion::Command(command.into());
        self
    }

    pub fn with_assertion(mut self, assertion: Assertion) -> Self {
        self.criterion = GateCriterion::Assertion(assertion);
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_after_tasks<I, S>(mut self, tasks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after_tasks = tasks.into_iter().map(Into::into).collect();
        self
    }
}

/// Standard escalation chain over the enabled gate types
///
/// Each gate requires every enabled gate in the nearest lower tier, so
/// disabling a tier links its neighbours directly.
pub fn default_gates(enabled: &[GateType]) -> Vec<ValidationGate> {
    let mut types: Vec<GateType> = enabled.to_vec();
    types.sort();
    types.dedup();

    let mut gates = Vec::with_capacity(types.len());
    let mut previous_tier: Vec<String> = Vec::new();
    let mut current_tier: Vec<String> = Vec::new();
    let mut tier = None;

    for gate_type in types {
        if tier != Some(gate_type.tier()) {
            if tier.is_some() {
                previous_tier = std::mem::take(&mut current_tier);
            }
            tier = Some(gate_type.tier());
        }
        gates.push(ValidationGate::builtin(gate_type).with_requires(previous_tier.clone()));
        current_tier.push(gate_type.as_str().to_string());
    }
    gates
}

/// How a gate ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    Failed,
    /// Nothing to check (tool missing, no command configured); counts as passed
    Skipped,
    /// Not run because a required gate did not pass
    Blocked,
}

/// Outcome of one gate over one file set
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub gate_id: String,
    pub gate_type: GateType,
    pub status: GateStatus,
    pub errors: Vec<String>,
    /// Non-blocking findings
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Quality score, 0-10
    pub score: f32,
    /// Confidence in the outcome, 0-1
    pub confidence: f32,
    /// Judge tier that decided a semantic gate
    #[serde(default)]
    pub tier: Option<JudgeTier>,
    pub duration_ms: u64,
}

impl GateResult {
    pub fn passed(gate: &ValidationGate) -> Self {
        Self::with_status(gate, GateStatus::Passed, Vec::new(), 10.0)
    }

    pub fn failed(gate: &ValidationGate, errors: Vec<String>) -> Self {
        Self::with_status(gate, GateStatus::Failed, errors, 0.0)
    }

    pub fn skipped(gate: &ValidationGate, reason: impl Into<String>) -> Self {
        let mut result = Self::with_status(gate, GateStatus::Skipped, Vec::new(), 10.0);
        result.warnings.push(reason.into());
        result
    }

    pub fn blocked(gate: &ValidationGate, blocked_by: &[String]) -> Self {
        let errors = vec![format!("not run: required gate(s) {} did not pass", blocked_by.join(", "))];
        let mut result = Self::with_status(gate, GateStatus::Blocked, errors, 0.0);
        result.confidence = 0.0;
        result
    }

    fn with_status(gate: &ValidationGate, status: GateStatus, errors: Vec<String>, score: f32) -> Self {
        Self {
            gate_id: gate.id.clone(),
            gate_type: gate.gate_type,
            status,
            errors,
            warnings: Vec::new(),
            score,
            confidence: 1.0,
            tier: None,
            duration_ms: 0,
        }
    }

    /// Passed or skipped
    pub fn is_pass(&self) -> bool {
        matches!(self.status, GateStatus::Passed | GateStatus::Skipped)
    }

    pub fn is_skipped(&self) -> bool {
        self.status == GateStatus::Skipped
    }

    /// Actually ran and failed (blocked gates are not counted)
    pub fn is_failure(&self) -> bool {
        self.status == GateStatus::Failed
    }
}
