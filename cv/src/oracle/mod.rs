//! Oracle - the boundary to the content generator
//!
//! The execution core never talks to a model directly. It asks an [`Oracle`]
//! for text (`generate`) or for a repair patch (`generate_fix`), and treats
//! everything behind the trait as opaque.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

mod error;
mod parse;
mod process;
mod prompts;

pub use error::OracleError;
pub use parse::{extract_json, parse_patch, strip_code_fence};
pub use process::ProcessOracle;
pub use prompts::{PromptLibrary, TemplateName};

/// Per-call generation knobs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerateOptions {
    /// Model hint; interpretation is up to the Oracle
    pub model: Option<String>,

    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,
}

impl GenerateOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }
}

/// Token accounting for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Rough count for oracles that do not report usage (4 chars per token)
    pub fn estimate(prompt: &str, output: &str) -> Self {
        Self {
            input_tokens: prompt.len().div_ceil(4) as u64,
            output_tokens: output.len().div_ceil(4) as u64,
        }
    }
}

/// Text produced by the Oracle
#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub content: String,
    pub usage: TokenUsage,
}

/// Current contents of a file handed to the Oracle for repair
#[derive(Debug, Clone, Serialize)]
pub struct FileSnapshot {
    pub path: PathBuf,
    pub content: String,
}

/// One failing gate, as reported to the Oracle
#[derive(Debug, Clone, Serialize)]
pub struct FailureReport {
    pub gate_id: String,
    pub gate_type: String,
    pub errors: Vec<String>,
}

/// Everything the Oracle needs to propose a fix
#[derive(Debug, Clone, Serialize)]
pub struct ErrorContext {
    pub iteration: u32,
    pub contract: String,
    pub files: Vec<FileSnapshot>,
    pub failures: Vec<FailureReport>,
}

/// Whole-file replacement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: PathBuf,
    pub content: String,
}

/// Set of edits proposed by the Oracle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patch {
    pub edits: Vec<FileEdit>,
    #[serde(skip)]
    pub usage: TokenUsage,
}

impl Patch {
    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }
}

/// Content generator used for discovery, generation, repair and judging
#[async_trait]
pub trait Oracle: Send + Sync {
    /// Produce text for a prompt
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation, OracleError>;

    /// Propose edits that make the failing gates pass
    ///
    /// The default renders the fix template and parses the reply as a patch.
    async fn generate_fix(&self, context: &ErrorContext) -> Result<Patch, OracleError> {
        let prompt = PromptLibrary::embedded().render(TemplateName::Fix, context)?;
        let generation = self.generate(&prompt, &GenerateOptions::default()).await?;
        let mut patch = parse_patch(&generation.content, &context.files)?;
        patch.usage = generation.usage;
        Ok(patch)
    }
}

/// Backoff schedule for transient Oracle failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }
}

/// Run `op` until it succeeds, fails permanently, or retries run out
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, OracleError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OracleError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let backoff = e.retry_after().unwrap_or_else(|| policy.backoff(attempt));
                warn!(
                    label,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "with_retry: retrying after transient error"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                debug!(label, attempt, error = %e, "with_retry: giving up");
                return Err(e);
            }
        }
    }
}

/// Oracle decorator that absorbs transient failures
pub struct RetryingOracle {
    inner: Arc<dyn Oracle>,
    policy: RetryPolicy,
}

impl RetryingOracle {
    pub fn new(inner: Arc<dyn Oracle>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Oracle for RetryingOracle {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation, OracleError> {
        with_retry(&self.policy, "generate", || self.inner.generate(prompt, options)).await
    }

    async fn generate_fix(&self, context: &ErrorContext) -> Result<Patch, OracleError> {
        with_retry(&self.policy, "generate_fix", || self.inner.generate_fix(context)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        fatal: bool,
    }

    #[async_trait]
    impl Oracle for Flaky {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<Generation, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal {
                return Err(OracleError::Unavailable("gone".to_string()));
            }
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(OracleError::Timeout(Duration::from_millis(1)));
            }
            Ok(Generation {
                content: "ok".to_string(),
                usage: TokenUsage::default(),
            })
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff(20), Duration::from_secs(30));
    }

    #[test]
    fn test_token_usage_estimate() {
        let usage = TokenUsage::estimate("abcd", "abcdefgh");
        assert_eq!(usage.input_tokens, 1);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.total(), 3);
    }

    #[tokio::test]
    async fn test_retrying_oracle_absorbs_transient_errors() {
        let inner = Arc::new(Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
            fatal: false,
        });
        let oracle = RetryingOracle::new(inner.clone(), fast_policy());

        let result = oracle.generate("hi", &GenerateOptions::default()).await.unwrap();
        assert_eq!(result.content, "ok");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retrying_oracle_gives_up_after_max_retries() {
        let inner = Arc::new(Flaky {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
            fatal: false,
        });
        let oracle = RetryingOracle::new(inner.clone(), fast_policy());

        let err = oracle.generate("hi", &GenerateOptions::default()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let inner = Arc::new(Flaky {
            failures_left: AtomicU32::new(0),
            calls: AtomicU32::new(0),
            fatal: true,
        });
        let oracle = RetryingOracle::new(inner.clone(), fast_policy());

        assert!(oracle.generate("hi", &GenerateOptions::default()).await.is_err());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
