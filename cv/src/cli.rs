//! CLI command definitions and output rendering

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use colored::Colorize;

use crate::checkpoint::AgentCheckpoint;
use crate::coordinator::FailurePolicy;
use crate::domain::TaskStatus;
use crate::run::{RunOutcome, RunStatus};

/// Convergent - execution core for an autonomous coding agent
#[derive(Parser)]
#[command(
    name = "cv",
    about = "Turn a goal into artifacts that pass their validation gates",
    version,
    after_help = "Logs are written to: ~/.local/share/convergent/logs/convergent.log"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Discover and execute the artifacts for a goal
    Run {
        /// What to build
        goal: String,

        /// Override the configured failure policy (continue, retry, abort, replan)
        #[arg(short, long)]
        policy: Option<FailurePolicy>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Continue a run from a checkpoint (default: the newest one)
    Resume {
        /// Checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show progress recorded in a checkpoint
    Status {
        /// Checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show the execution waves of a checkpointed run
    Waves {
        /// Checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,
    },

    /// Remove stale lock files
    Unlock,
}

/// Output format for run/status commands
#[derive(Clone, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use: text or json", s)),
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Path of the log file written by the binary
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convergent")
        .join("logs")
        .join("convergent.log")
}

fn status_label(status: TaskStatus) -> String {
    let label = format!("{:<9}", status.to_string());
    match status {
        TaskStatus::Completed => label.green().to_string(),
        TaskStatus::Failed => label.red().to_string(),
        TaskStatus::Skipped => label.yellow().to_string(),
        TaskStatus::Running => label.cyan().to_string(),
        TaskStatus::Pending => label.dimmed().to_string(),
    }
}

pub fn render_outcome(outcome: &RunOutcome) -> String {
    let status = match outcome.status {
        RunStatus::Succeeded => outcome.status.to_string().green().bold(),
        RunStatus::Failed => outcome.status.to_string().red().bold(),
        RunStatus::Aborted | RunStatus::Cancelled => outcome.status.to_string().yellow().bold(),
    };
    let mut out = format!("Run {} {}: {}\n", outcome.run_id.bold(), status, outcome.reason);
    out.push_str(&format!(
        "  completed: {}  failed: {}  skipped: {}\n",
        outcome.completed.len(),
        outcome.failed.len(),
        outcome.skipped.len()
    ));
    if !outcome.failed.is_empty() {
        out.push_str(&format!("  failed tasks: {}\n", outcome.failed.join(", ")));
    }
    if let Some(path) = &outcome.checkpoint_path {
        out.push_str(&format!("  checkpoint: {}\n", path.display()));
        if !outcome.is_success() {
            out.push_str(&format!("  resume with: cv resume --checkpoint {}\n", path.display()));
        }
    }
    out
}

pub fn render_status(checkpoint: &AgentCheckpoint, path: &std::path::Path) -> String {
    let summary = checkpoint.progress_summary();
    let mut out = format!("Run {}\n", checkpoint.run_id.bold());
    out.push_str(&format!("  goal:       {}\n", checkpoint.goal));
    out.push_str(&format!("  checkpoint: {}\n", path.display()));
    out.push_str(&format!("  saved at:   {}\n", checkpoint.checkpoint_at.to_rfc3339()));
    out.push_str(&format!("  progress:   {}\n\n", summary));
    for task in &checkpoint.tasks {
        out.push_str(&format!("  {} {}", status_label(task.status), task.id));
        if let Some(error) = &task.last_error {
            out.push_str(&format!("  ({})", error));
        }
        out.push('\n');
    }
    out
}

pub fn render_waves(checkpoint: &AgentCheckpoint, waves: &[Vec<String>]) -> String {
    let mut out = String::new();
    for (i, wave) in waves.iter().enumerate() {
        out.push_str(&format!("{} {}\n", "Wave".bold(), i));
        for id in wave {
            let status = checkpoint.task(id).map(|t| t.status).unwrap_or_default();
            out.push_str(&format!("  {} {}\n", status_label(status), id));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{ParallelConfig, TaskExecutionConfig};
    use crate::domain::Task;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["cv", "run", "Add a CSV parser"]);
        if let Command::Run { goal, policy, format } = cli.command {
            assert_eq!(goal, "Add a CSV parser");
            assert!(policy.is_none());
            assert!(matches!(format, OutputFormat::Text));
        } else {
            panic!("Expected Run command");
        }
    }

    #[test]
    fn test_cli_parse_run_with_policy() {
        let cli = Cli::parse_from(["cv", "run", "goal", "--policy", "abort", "-f", "json"]);
        assert!(matches!(
            cli.command,
            Command::Run {
                policy: Some(FailurePolicy::Abort),
                format: OutputFormat::Json,
                ..
            }
        ));
    }

    #[test]
    fn test_cli_parse_resume_and_status() {
        let cli = Cli::parse_from(["cv", "resume", "--checkpoint", "/tmp/wave-001.json"]);
        assert!(matches!(cli.command, Command::Resume { checkpoint: Some(_), .. }));

        let cli = Cli::parse_from(["cv", "status"]);
        assert!(matches!(cli.command, Command::Status { checkpoint: None, .. }));

        let cli = Cli::parse_from(["cv", "unlock"]);
        assert!(matches!(cli.command, Command::Unlock));
    }

    #[test]
    fn test_cli_with_config() {
        let cli = Cli::parse_from(["cv", "-c", "/path/to/config.yml", "-v", "waves"]);
        assert_eq!(cli.config, Some(PathBuf::from("/path/to/config.yml")));
        assert!(cli.verbose);
    }

    #[test]
    fn test_output_format_from_str() {
        assert!(matches!("text".parse::<OutputFormat>(), Ok(OutputFormat::Text)));
        assert!(matches!("JSON".parse::<OutputFormat>(), Ok(OutputFormat::Json)));
        assert!("table".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_render_outcome_suggests_resume() {
        let outcome = RunOutcome {
            run_id: "abc123-run-x".into(),
            status: RunStatus::Aborted,
            completed: vec!["a".into()],
            failed: vec!["b".into()],
            skipped: vec![],
            gate_failures: vec![],
            checkpoint_path: Some(PathBuf::from("/tmp/run/wave-000.json")),
            reason: "task b failed".into(),
            tokens_used: 0,
        };
        let text = render_outcome(&outcome);
        assert!(text.contains("task b failed"));
        assert!(text.contains("cv resume --checkpoint /tmp/run/wave-000.json"));
    }

    #[test]
    fn test_render_waves_lists_every_task() {
        let checkpoint = AgentCheckpoint::new(
            "r",
            "g",
            vec![Task::new("a", "a"), Task::new("b", "b").with_depends_on(["a"])],
            "/tmp",
            TaskExecutionConfig::default(),
            ParallelConfig::default(),
        );
        let text = render_waves(&checkpoint, &[vec!["a".into()], vec!["b".into()]]);
        assert!(text.contains("Wave"));
        assert!(text.contains(" a\n"));
        assert!(text.contains(" b\n"));
    }
}
