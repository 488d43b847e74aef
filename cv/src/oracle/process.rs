//! ProcessOracle - an Oracle backed by an external command
//!
//! The command receives the prompt on stdin and answers on stdout. Any model
//! CLI that follows that convention can drive the execution core.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{GenerateOptions, Generation, Oracle, OracleError, TokenUsage};

/// Environment variable carrying the model hint to the command
pub const MODEL_ENV: &str = "CONVERGENT_MODEL";

/// Environment variable carrying the token limit to the command
pub const MAX_TOKENS_ENV: &str = "CONVERGENT_MAX_TOKENS";

pub struct ProcessOracle {
    command: String,
    working_dir: PathBuf,
    timeout: Duration,
    default_model: Option<String>,
}

impl ProcessOracle {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            timeout,
            default_model: None,
        }
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Oracle for ProcessOracle {
    async fn generate(&self, prompt: &str, options: &GenerateOptions) -> Result<Generation, OracleError> {
        debug!(command = %self.command, prompt_len = prompt.len(), "ProcessOracle::generate: called");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(model) = options.model.as_ref().or(self.default_model.as_ref()) {
            cmd.env(MODEL_ENV, model);
        }
        if let Some(max_tokens) = options.max_tokens {
            cmd.env(MAX_TOKENS_ENV, max_tokens.to_string());
        }

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                OracleError::Unavailable(format!("cannot start `{}`: {}", self.command, e))
            }
            _ => OracleError::Io(e),
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores stdin may close it early
            if let Err(e) = stdin.write_all(prompt.as_bytes()).await {
                warn!(error = %e, "ProcessOracle::generate: failed writing prompt");
            }
            drop(stdin);
        }

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| OracleError::Timeout(self.timeout))??;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr.lines().last().unwrap_or("").trim().to_string();
            debug!(code, %message, "ProcessOracle::generate: command failed");
            return Err(OracleError::Process { code, message });
        }

        let usage = TokenUsage::estimate(prompt, &stdout);
        debug!(output_len = stdout.len(), "ProcessOracle::generate: done");
        Ok(Generation { content: stdout, usage })
    }
}
