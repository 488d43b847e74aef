//! Convergent configuration types and loading

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use runstore::{DEFAULT_STALE_AFTER_SECS, LockConfig};
use serde::{Deserialize, Serialize};

use crate::convergence::ConvergenceConfig;
use crate::coordinator::{ParallelConfig, TaskExecutionConfig};
use crate::gate::{GateRunner, GateType, JudgeConfig, TieredJudge, ValidationGate};
use crate::graph::DiscoveryConfig;
use crate::oracle::{GenerateOptions, Oracle, PromptLibrary, RetryPolicy};
use crate::run::RunSettings;

/// Main Convergent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External model command
    pub oracle: OracleConfig,

    /// Goal decomposition limits
    pub discovery: DiscoveryConfig,

    /// Repair loop limits
    pub convergence: ConvergenceConfig,

    /// Semantic gate thresholds
    pub judge: JudgeConfig,

    /// Validator commands and custom gates
    pub gates: GatesConfig,

    /// File lock settings
    pub locks: LocksConfig,

    /// Failure policy and retries
    pub execution: TaskExecutionConfig,

    /// Concurrency limits
    pub parallel: ParallelConfig,

    /// Checkpoint location
    pub checkpoint: CheckpointConfig,
}

impl Config {
    /// Validate configuration before use
    ///
    /// Call this early in startup to fail fast with clear error messages.
    pub fn validate(&self) -> Result<()> {
        if self.convergence.max_iterations == 0 {
            return Err(eyre::eyre!("convergence.max-iterations must be at least 1"));
        }
        if self.convergence.escalate_after_same_error == 0 {
            return Err(eyre::eyre!("convergence.escalate-after-same-error must be at least 1"));
        }
        if self.discovery.max_artifacts == 0 || self.discovery.max_depth == 0 {
            return Err(eyre::eyre!("discovery.max-artifacts and discovery.max-depth must be at least 1"));
        }
        if self.parallel.max_parallel_tasks == 0 || self.parallel.max_parallel_writes == 0 {
            return Err(eyre::eyre!(
                "parallel.max-parallel-tasks and parallel.max-parallel-writes must be at least 1"
            ));
        }
        if self.execution.retry_backoff_seconds < 0.0 {
            return Err(eyre::eyre!("execution.retry-backoff-seconds must not be negative"));
        }

        let judge = &self.judge;
        if !(0.0..=1.0).contains(&judge.confidence_threshold) {
            return Err(eyre::eyre!(
                "judge.confidence-threshold must be between 0 and 1, got {}",
                judge.confidence_threshold
            ));
        }
        for (name, value) in [
            ("purity-threshold", judge.purity_threshold),
            ("auto-approve", judge.auto_approve),
            ("auto-reject", judge.auto_reject),
        ] {
            if !(0.0..=10.0).contains(&value) {
                return Err(eyre::eyre!("judge.{} must be between 0 and 10, got {}", name, value));
            }
        }
        if judge.auto_reject >= judge.auto_approve {
            return Err(eyre::eyre!(
                "judge.auto-reject ({}) must be below judge.auto-approve ({})",
                judge.auto_reject,
                judge.auto_approve
            ));
        }
        Ok(())
    }

    /// Oracle command, required by commands that talk to a model
    pub fn require_oracle_command(&self) -> Result<&str> {
        self.oracle
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| eyre::eyre!("oracle.command is not set. Add it to .convergent.yml"))
    }

    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Try project-local config: .convergent.yml
        let local_config = PathBuf::from(".convergent.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // Try user config: ~/.config/convergent/convergent.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("convergent").join("convergent.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            discovery: self.discovery.clone(),
            convergence: self.convergence.clone(),
            execution: self.execution.clone(),
            parallel: self.parallel.clone(),
            generate: self.oracle.generate_options(),
            lock_timeout: Duration::from_secs(self.locks.timeout_seconds),
            record_events: self.checkpoint.record_events,
        }
    }

    pub fn lock_config(&self) -> LockConfig {
        let mut config = LockConfig::new(self.locks.lock_dir());
        config.stale_after = Duration::from_secs(self.locks.stale_after_seconds);
        config
    }

    pub fn prompts(&self) -> PromptLibrary {
        PromptLibrary::load(self.oracle.prompts_dir.as_deref())
    }

    /// Gate runner with the configured validator commands and judge
    pub fn gate_runner(
        &self,
        working_dir: &Path,
        oracle: Arc<dyn Oracle>,
        prompts: Arc<PromptLibrary>,
    ) -> GateRunner {
        let judge = TieredJudge::from_oracle(self.judge.clone(), oracle, prompts);
        let mut runner = GateRunner::new(working_dir)
            .with_command_timeout(Duration::from_secs(self.gates.command_timeout_seconds))
            .with_retries(self.gates.retries)
            .with_judge(Arc::new(judge));
        for (gate_type, command) in &self.gates.commands {
            runner = runner.with_command(*gate_type, command.clone());
        }
        runner
    }
}

/// External model command
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    /// Shell command that reads a prompt on stdin and answers on stdout
    pub command: Option<String>,

    /// Model hint passed to the command
    pub model: Option<String>,

    #[serde(rename = "max-tokens")]
    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,

    /// Per-call timeout
    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,

    /// Retries of transient failures
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "initial-backoff-ms")]
    pub initial_backoff_ms: u64,

    #[serde(rename = "max-backoff-ms")]
    pub max_backoff_ms: u64,

    /// Directory of `{name}.hbs` prompt overrides
    #[serde(rename = "prompts-dir")]
    pub prompts_dir: Option<PathBuf>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            command: None,
            model: None,
            max_tokens: Some(8192),
            temperature: None,
            timeout_seconds: 300,
            max_retries: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            prompts_dir: None,
        }
    }
}

impl OracleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

/// Validator commands and custom gates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatesConfig {
    /// Command run by the builtin gate of each type; `{files}` expands to the file list
    pub commands: BTreeMap<GateType, String>,

    #[serde(rename = "command-timeout-seconds")]
    pub command_timeout_seconds: u64,

    /// Extra attempts after a transient validator failure
    pub retries: u32,

    /// Gates added to the builtin chain
    pub custom: Vec<ValidationGate>,
}

impl Default for GatesConfig {
    fn default() -> Self {
        Self {
            commands: BTreeMap::new(),
            command_timeout_seconds: 120,
            retries: 1,
            custom: Vec::new(),
        }
    }
}

/// File lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocksConfig {
    /// Lock directory (default: ~/.local/share/convergent/locks)
    pub dir: Option<PathBuf>,

    /// How long a write waits for its locks
    #[serde(rename = "timeout-seconds")]
    pub timeout_seconds: u64,

    #[serde(rename = "stale-after-seconds")]
    pub stale_after_seconds: u64,
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            dir: None,
            timeout_seconds: 30,
            stale_after_seconds: DEFAULT_STALE_AFTER_SECS,
        }
    }
}

impl LocksConfig {
    pub fn lock_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("convergent")
                .join("locks")
        })
    }
}

/// Checkpoint location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Root of the run directories, relative to the working directory
    pub root: PathBuf,

    /// Write `events.jsonl` next to the checkpoints
    #[serde(rename = "record-events")]
    pub record_events: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".convergent").join("checkpoints"),
            record_events: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::FailurePolicy;
    use crate::gate::{Assertion, GateCriterion};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.convergence.max_iterations, 5);
        assert_eq!(config.execution.failure_policy, FailurePolicy::Continue);
        assert_eq!(config.parallel.max_parallel_tasks, 8);
        assert!(config.require_oracle_command().is_err());
    }

    #[test]
    fn test_deserialize_config() {
        let yaml = r###"
oracle:
  command: "claude -p"
  model: sonnet
  timeout-seconds: 60
convergence:
  max-iterations: 3
  enabled-gates: [syntax, lint]
gates:
  commands:
    lint: "ruff check {files}"
  custom:
    - id: readme
      gate_type: lint
      after_tasks: [docs]
      criterion:
        assertion:
          contains: "## Usage"
execution:
  failure-policy: retry
  max-retries-per-task: 4
parallel:
  max-parallel-writes: 1
checkpoint:
  root: /tmp/cv-checkpoints
"###;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.require_oracle_command().unwrap(), "claude -p");
        assert_eq!(config.oracle.timeout(), Duration::from_secs(60));
        assert_eq!(config.convergence.max_iterations, 3);
        assert_eq!(config.convergence.enabled_gates, vec![GateType::Syntax, GateType::Lint]);
        assert_eq!(config.gates.commands.get(&GateType::Lint).unwrap(), "ruff check {files}");
        assert_eq!(config.gates.custom[0].after_tasks, vec!["docs"]);
        assert_eq!(
            config.gates.custom[0].criterion,
            GateCriterion::Assertion(Assertion::Contains("## Usage".into()))
        );
        assert_eq!(config.execution.failure_policy, FailurePolicy::Retry);
        assert_eq!(config.execution.max_retries_per_task, 4);
        assert_eq!(config.parallel.max_parallel_writes, 1);
        assert_eq!(config.parallel.max_parallel_tasks, 8);
        assert_eq!(config.checkpoint.root, PathBuf::from("/tmp/cv-checkpoints"));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: Config = serde_yaml::from_str("discovery:\n  max-artifacts: 10\n").unwrap();
        assert_eq!(config.discovery.max_artifacts, 10);
        assert_eq!(config.discovery.max_retries, 3);
        assert_eq!(config.judge.auto_approve, 8.0);
        assert!(config.checkpoint.record_events);
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = Config::default();
        config.convergence.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.judge.auto_reject = 9.0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.judge.confidence_threshold = 1.5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.parallel.max_parallel_writes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_missing_file_errors() {
        let path = PathBuf::from("/nonexistent/convergent.yml");
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn test_run_settings_carry_sections() {
        let mut config = Config::default();
        config.oracle.model = Some("small".into());
        config.locks.timeout_seconds = 7;
        let settings = config.run_settings();
        assert_eq!(settings.generate.model.as_deref(), Some("small"));
        assert_eq!(settings.lock_timeout, Duration::from_secs(7));
        assert_eq!(config.lock_config().stale_after, Duration::from_secs(DEFAULT_STALE_AFTER_SECS));
    }
}
