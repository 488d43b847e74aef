//! Convergence loop configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::gate::GateType;

/// Limits and gates for one convergence loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConvergenceConfig {
    /// Validation passes before escalating
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Wall-clock budget for the whole loop
    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,

    /// Escalate once one failure signature has been seen this many times
    #[serde(rename = "escalate-after-same-error")]
    pub escalate_after_same_error: u32,

    #[serde(rename = "enabled-gates")]
    pub enabled_gates: Vec<GateType>,

    /// Pause between applying a repair and re-validating
    #[serde(rename = "debounce-ms")]
    pub debounce_ms: u64,

    /// Oracle token budget for repairs (0 is unlimited)
    #[serde(rename = "max-tokens")]
    pub max_tokens: u64,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            timeout_seconds: 300,
            escalate_after_same_error: 3,
            enabled_gates: vec![GateType::Syntax, GateType::Lint, GateType::Type],
            debounce_ms: 200,
            max_tokens: 50_000,
        }
    }
}

impl ConvergenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_kebab_keys() {
        let config: ConvergenceConfig = serde_yaml::from_str(
            "max-iterations: 3\nescalate-after-same-error: 2\nenabled-gates: [syntax, semantic]\n",
        )
        .unwrap();
        assert_eq!(config.max_iterations, 3);
        assert_eq!(config.escalate_after_same_error, 2);
        assert_eq!(config.enabled_gates, vec![GateType::Syntax, GateType::Semantic]);
        assert_eq!(config.timeout_seconds, 300);
    }
}
