//! Binary smoke tests

use std::path::Path;

use assert_cmd::Command;
use convergent::checkpoint::AgentCheckpoint;
use convergent::coordinator::{ParallelConfig, TaskExecutionConfig};
use convergent::domain::Task;
use predicates::prelude::*;
use runstore::CheckpointStore;
use tempfile::{TempDir, tempdir};

/// `cv` isolated from the user's home, config and logs
fn cv(temp: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("cv").unwrap();
    cmd.current_dir(temp.path())
        .env("HOME", temp.path())
        .env("XDG_CONFIG_HOME", temp.path().join("config"))
        .env("XDG_DATA_HOME", temp.path().join("data"))
        .env_remove("RUST_LOG");
    cmd
}

fn write_checkpoint(root: &Path) -> std::path::PathBuf {
    let store = CheckpointStore::open(root.join(".convergent/checkpoints")).unwrap();
    let run_dir = store.create_run(chrono::Utc::now()).unwrap();
    let mut checkpoint = AgentCheckpoint::new(
        "0a1b2c-run-csv",
        "Add a CSV parser with a streaming reader",
        vec![
            Task::new("reader", "streaming reader").with_target("reader.py"),
            Task::new("parser", "csv parser")
                .with_target("parser.py")
                .with_depends_on(["reader"]),
        ],
        root,
        TaskExecutionConfig::default(),
        ParallelConfig::default(),
    );
    checkpoint.completed_ids.push("reader".to_string());
    let path = CheckpointStore::wave_path(&run_dir, 0);
    checkpoint.save(&store, &path).unwrap();
    path
}

#[test]
fn test_help_lists_commands() {
    let temp = tempdir().unwrap();
    cv(&temp)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("resume"))
        .stdout(predicate::str::contains("waves"));
}

#[test]
fn test_status_without_checkpoints() {
    let temp = tempdir().unwrap();
    cv(&temp)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("No checkpoints found"));
}

#[test]
fn test_status_reads_latest_checkpoint() {
    let temp = tempdir().unwrap();
    write_checkpoint(temp.path());

    cv(&temp)
        .args(["status", "--format", "json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0a1b2c-run-csv"))
        .stdout(predicate::str::contains("\"completed\": 1"));
}

#[test]
fn test_waves_orders_dependencies() {
    let temp = tempdir().unwrap();
    let path = write_checkpoint(temp.path());

    let output = cv(&temp)
        .args(["waves", "--checkpoint"])
        .arg(&path)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let reader = stdout.find("reader").unwrap();
    let parser = stdout.find("parser").unwrap();
    assert!(reader < parser);
}

#[test]
fn test_run_requires_oracle_command() {
    let temp = tempdir().unwrap();
    cv(&temp)
        .args(["run", "Add a CSV parser"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("oracle.command"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp = tempdir().unwrap();
    std::fs::write(
        temp.path().join(".convergent.yml"),
        "parallel:\n  max-parallel-tasks: 0\n",
    )
    .unwrap();

    cv(&temp)
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid configuration"));
}

#[test]
fn test_unknown_policy_is_a_usage_error() {
    let temp = tempdir().unwrap();
    cv(&temp)
        .args(["run", "goal", "--policy", "sometimes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("sometimes"));
}
