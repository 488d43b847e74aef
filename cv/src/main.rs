//! Convergent - execution core for an autonomous coding agent
//!
//! CLI entry point for running, resuming and inspecting runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result};
use tracing::{info, warn};

use convergent::checkpoint::AgentCheckpoint;
use convergent::cli::{Cli, Command, OutputFormat, get_log_path, render_outcome, render_status, render_waves};
use convergent::config::Config;
use convergent::events::TracingHook;
use convergent::graph::layer_waves;
use convergent::oracle::{Oracle, ProcessOracle, RetryingOracle};
use convergent::run::{RunContext, RunOutcome, Runner};
use runstore::{CheckpointStore, FileLockManager};

fn setup_logging(verbose: bool) -> Result<()> {
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Log to file; stdout is for command output
    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };
    let log_file = fs::File::create(&log_path).context("Failed to create log file")?;

    tracing_subscriber::fmt()
        .with_writer(log_file)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (verbose: {})", verbose);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose).context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let working_dir = std::env::current_dir().context("Failed to read current directory")?;
    info!(working_dir = %working_dir.display(), "Convergent starting");

    match cli.command {
        Command::Run { goal, policy, format } => {
            let mut config = config;
            if let Some(policy) = policy {
                config.execution.failure_policy = policy;
            }
            cmd_run(&config, &working_dir, &goal, format).await
        }
        Command::Resume { checkpoint, format } => cmd_resume(&config, &working_dir, checkpoint, format).await,
        Command::Status { checkpoint, format } => cmd_status(&config, &working_dir, checkpoint, format),
        Command::Waves { checkpoint } => cmd_waves(&config, &working_dir, checkpoint),
        Command::Unlock => cmd_unlock(&config),
    }
}

fn open_store(config: &Config, working_dir: &Path) -> Result<CheckpointStore> {
    let root = working_dir.join(&config.checkpoint.root);
    CheckpointStore::open(&root).context(format!("Failed to open checkpoint store at {}", root.display()))
}

/// Explicit checkpoint, or the newest one under the store
fn find_checkpoint(store: &CheckpointStore, explicit: Option<PathBuf>) -> Result<Option<PathBuf>> {
    match explicit {
        Some(path) => Ok(Some(path)),
        None => Ok(store.latest()?),
    }
}

fn build_runner(config: &Config, working_dir: &Path) -> Result<Runner> {
    let command = config.require_oracle_command()?;
    let mut process = ProcessOracle::new(command, working_dir, config.oracle.timeout());
    if let Some(model) = &config.oracle.model {
        process = process.with_default_model(model.clone());
    }
    let oracle: Arc<dyn Oracle> = Arc::new(RetryingOracle::new(Arc::new(process), config.oracle.retry_policy()));

    let locks = Arc::new(FileLockManager::with_config(config.lock_config()).context("Failed to open lock directory")?);
    let store = open_store(config, working_dir)?;
    let prompts = Arc::new(config.prompts());
    let gate_runner = config.gate_runner(working_dir, oracle.clone(), prompts.clone());

    let ctx = RunContext::new(working_dir, oracle, locks, store, config.run_settings())
        .with_prompts(prompts)
        .with_gate_runner(gate_runner)
        .with_gates(config.gates.custom.clone());
    ctx.bus.register_hook(Arc::new(TracingHook));

    // Ctrl-C stops between waves and interrupts convergence loops
    let cancel = ctx.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    Ok(Runner::new(ctx))
}

fn report(outcome: RunOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&outcome)?),
        OutputFormat::Text => print!("{}", render_outcome(&outcome)),
    }
    if outcome.is_success() {
        Ok(())
    } else {
        Err(eyre::eyre!("run {}: {}", outcome.status, outcome.reason))
    }
}

async fn cmd_run(config: &Config, working_dir: &Path, goal: &str, format: OutputFormat) -> Result<()> {
    info!(%goal, "cmd_run: called");
    let runner = build_runner(config, working_dir)?;
    let outcome = runner.run(goal).await.context("Run failed")?;
    report(outcome, format)
}

async fn cmd_resume(
    config: &Config,
    working_dir: &Path,
    checkpoint: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let runner = build_runner(config, working_dir)?;
    let latest = match checkpoint {
        Some(path) => Some(path),
        None => runner.latest_checkpoint()?,
    };
    let Some(path) = latest else {
        println!("No checkpoints found");
        return Ok(());
    };
    info!(path = %path.display(), "cmd_resume: called");
    let outcome = runner
        .resume(&path)
        .await
        .context(format!("Failed to resume from {}", path.display()))?;
    report(outcome, format)
}

fn cmd_status(config: &Config, working_dir: &Path, checkpoint: Option<PathBuf>, format: OutputFormat) -> Result<()> {
    let store = open_store(config, working_dir)?;
    let Some(path) = find_checkpoint(&store, checkpoint)? else {
        println!("No checkpoints found");
        return Ok(());
    };
    let loaded = AgentCheckpoint::load(&store, &path)?;

    match format {
        OutputFormat::Json => {
            let json = serde_json::json!({
                "checkpoint": path,
                "run_id": loaded.run_id,
                "goal": loaded.goal,
                "summary": loaded.progress_summary(),
                "tasks": loaded.tasks,
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
        }
        OutputFormat::Text => print!("{}", render_status(&loaded, &path)),
    }
    Ok(())
}

fn cmd_waves(config: &Config, working_dir: &Path, checkpoint: Option<PathBuf>) -> Result<()> {
    let store = open_store(config, working_dir)?;
    let Some(path) = find_checkpoint(&store, checkpoint)? else {
        println!("No checkpoints found");
        return Ok(());
    };
    let loaded = AgentCheckpoint::load(&store, &path)?;
    let waves = layer_waves(loaded.tasks.iter().map(|t| (t.id.as_str(), t.depends_on.as_slice())))?;
    print!("{}", render_waves(&loaded, &waves));
    Ok(())
}

fn cmd_unlock(config: &Config) -> Result<()> {
    let locks = FileLockManager::with_config(config.lock_config()).context("Failed to open lock directory")?;
    let removed = locks.reap_stale()?;
    println!("Removed {} stale lock(s) from {}", removed, config.locks.lock_dir().display());
    Ok(())
}
