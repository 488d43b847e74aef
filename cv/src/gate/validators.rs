//! Gate validators that need no model: shell commands and content assertions

use std::path::Path;
use std::time::{Duration, Instant};

use regex::Regex;
use tracing::debug;

use super::Assertion;
use crate::oracle::FileSnapshot;

/// Exit code `sh` uses for "command not found"
pub const EXIT_NOT_FOUND: i32 = 127;

/// Most error lines kept from a failing command
const MAX_ERROR_LINES: usize = 40;

/// Result of running a validation command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code from the command (-1 when killed by a signal)
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// The tool the command needs is not installed
    pub fn tool_missing(&self) -> bool {
        self.exit_code == EXIT_NOT_FOUND
    }

    /// Non-empty output lines, stderr first, capped
    pub fn error_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .stderr
            .lines()
            .chain(self.stdout.lines())
            .map(str::trim_end)
            .filter(|l| !l.trim().is_empty())
            .map(String::from)
            .collect();
        if lines.len() > MAX_ERROR_LINES {
            let dropped = lines.len() - MAX_ERROR_LINES;
            lines.truncate(MAX_ERROR_LINES);
            lines.push(format!("... {} more lines", dropped));
        }
        if lines.is_empty() {
            lines.push(format!("command exited with {}", self.exit_code));
        }
        lines
    }
}

/// Run a validation command in the workspace
///
/// `{files}` in the command expands to the shell-quoted file list.
pub async fn run_command(
    command: &str,
    files: &[FileSnapshot],
    working_dir: &Path,
    timeout: Duration,
) -> std::io::Result<CommandOutput> {
    let command = expand_files(command, files);
    debug!(%command, "run_command: called");
    let start = Instant::now();

    let output = tokio::time::timeout(
        timeout,
        tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&command)
            .current_dir(working_dir)
            .kill_on_drop(true)
            .output(),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, format!("`{}` timed out after {:?}", command, timeout)))??;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn expand_files(command: &str, files: &[FileSnapshot]) -> String {
    if !command.contains("{files}") {
        return command.to_string();
    }
    let list = files
        .iter()
        .map(|f| shell_quote(&f.path.to_string_lossy()))
        .collect::<Vec<_>>()
        .join(" ");
    command.replace("{files}", &list)
}

fn shell_quote(s: &str) -> String {
    if !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || "/._-+".contains(c)) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Evaluate a content assertion against every file
///
/// `Contains` and `Matches` need at least one file to match; `NotContains`
/// fails on any file that contains the needle.
pub fn check_assertion(assertion: &Assertion, files: &[FileSnapshot]) -> (bool, Vec<String>) {
    match assertion {
        Assertion::Contains(needle) => {
            if files.iter().any(|f| f.content.contains(needle.as_str())) {
                (true, Vec::new())
            } else {
                (false, vec![format!("no file contains `{}`", needle)])
            }
        }
        Assertion::NotContains(needle) => {
            let errors: Vec<String> = files
                .iter()
                .filter(|f| f.content.contains(needle.as_str()))
                .map(|f| format!("{}: must not contain `{}`", f.path.display(), needle))
                .collect();
            (errors.is_empty(), errors)
        }
        Assertion::Matches(pattern) => match Regex::new(pattern) {
            Ok(re) if files.iter().any(|f| re.is_match(&f.content)) => (true, Vec::new()),
            Ok(_) => (false, vec![format!("no file matches /{}/", pattern)]),
            Err(e) => (false, vec![format!("invalid pattern /{}/: {}", pattern, e)]),
        },
    }
}
