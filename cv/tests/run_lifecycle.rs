//! End-to-end runs over a scripted Oracle

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use convergent::checkpoint::AgentCheckpoint;
use convergent::coordinator::{FailurePolicy, ParallelConfig, TaskExecutionConfig};
use convergent::events::read_event_log;
use convergent::gate::{Assertion, GateType, ValidationGate};
use convergent::oracle::{GenerateOptions, Generation, Oracle, OracleError};
use convergent::run::{CancelToken, EVENT_LOG_FILE, RunContext, RunSettings, RunStatus, Runner};
use convergent::{ExecError, Task, TaskStatus};
use runstore::{CheckpointStore, FileLockManager};
use tempfile::{TempDir, tempdir};

const GOAL: &str = "Build a small text statistics package with a tokenizer, a word counter and a report module";

/// How a target misbehaves
#[derive(Clone, Copy)]
enum Failure {
    /// Transient errors this many times, then success
    Transient(u32),
    /// Non-retryable error every time
    Always,
}

/// Answers discovery prompts from a queue and generation prompts per target
#[derive(Default)]
struct Scripted {
    plans: Mutex<VecDeque<String>>,
    last_plan: Mutex<String>,
    failures: Mutex<HashMap<String, Failure>>,
    generated: Mutex<Vec<String>>,
    discovery_prompts: Mutex<Vec<String>>,
}

impl Scripted {
    fn new(plans: &[&str]) -> Self {
        Self {
            plans: Mutex::new(plans.iter().map(|p| p.to_string()).collect()),
            ..Default::default()
        }
    }

    fn failing(self, target: &str, failure: Failure) -> Self {
        self.failures.lock().unwrap().insert(target.to_string(), failure);
        self
    }

    fn generated(&self) -> Vec<String> {
        self.generated.lock().unwrap().clone()
    }
}

fn target_in(prompt: &str) -> Option<String> {
    let rest = prompt.split_once("Write the complete contents of `")?.1;
    Some(rest.split_once('`')?.0.to_string())
}

#[async_trait]
impl Oracle for Scripted {
    async fn generate(&self, prompt: &str, _options: &GenerateOptions) -> Result<Generation, OracleError> {
        if prompt.contains("You are planning the artifacts") {
            self.discovery_prompts.lock().unwrap().push(prompt.to_string());
            let mut last = self.last_plan.lock().unwrap();
            if let Some(plan) = self.plans.lock().unwrap().pop_front() {
                *last = plan;
            }
            return Ok(Generation {
                content: last.clone(),
                ..Default::default()
            });
        }

        let target = target_in(prompt).ok_or_else(|| OracleError::InvalidResponse("unexpected prompt".into()))?;
        self.generated.lock().unwrap().push(target.clone());

        let mut failures = self.failures.lock().unwrap();
        match failures.get(&target).copied() {
            Some(Failure::Always) => {
                return Err(OracleError::InvalidResponse(format!("cannot write {}", target)));
            }
            Some(Failure::Transient(n)) if n > 0 => {
                failures.insert(target.clone(), Failure::Transient(n - 1));
                return Err(OracleError::Timeout(Duration::from_millis(1)));
            }
            _ => {}
        }
        let name = target.trim_end_matches(".py");
        Ok(Generation {
            content: format!("```python\ndef {}():\n    return 1\n```", name),
            ..Default::default()
        })
    }
}

fn plan(entries: &[(&str, &[&str])]) -> String {
    let specs: Vec<serde_json::Value> = entries
        .iter()
        .map(|(id, requires)| {
            serde_json::json!({
                "id": id,
                "description": format!("module {}", id),
                "contract": format!("defines {}()", id),
                "produces": format!("{}.py", id),
                "requires": requires,
            })
        })
        .collect();
    serde_json::to_string(&specs).unwrap()
}

fn chain_plan() -> String {
    plan(&[("a", &[]), ("b", &["a"]), ("c", &["b"]), ("d", &[])])
}

fn settings(policy: FailurePolicy) -> RunSettings {
    let mut settings = RunSettings::default();
    settings.convergence.enabled_gates = vec![GateType::Syntax];
    settings.convergence.debounce_ms = 0;
    settings.execution = TaskExecutionConfig {
        failure_policy: policy,
        max_retries_per_task: 2,
        retry_backoff_seconds: 0.01,
        ..Default::default()
    };
    settings.parallel = ParallelConfig {
        enabled: true,
        max_parallel_tasks: 4,
        max_parallel_writes: 2,
    };
    settings
}

fn work_dir(temp: &TempDir) -> PathBuf {
    let work = temp.path().join("work");
    std::fs::create_dir_all(&work).unwrap();
    work
}

fn context(temp: &TempDir, oracle: Arc<Scripted>, settings: RunSettings) -> RunContext {
    let work = work_dir(temp);
    let locks = Arc::new(FileLockManager::new(temp.path().join("locks")).unwrap());
    let store = CheckpointStore::open(work.join(".convergent/checkpoints")).unwrap();
    RunContext::new(&work, oracle, locks, store, settings)
}

fn ids(list: &[String]) -> BTreeSet<&str> {
    list.iter().map(String::as_str).collect()
}

fn load(path: &Path) -> AgentCheckpoint {
    let store = CheckpointStore::open(path.parent().unwrap()).unwrap();
    AgentCheckpoint::load(&store, path).unwrap()
}

#[tokio::test]
async fn test_run_executes_every_wave() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&[&chain_plan()]));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Continue)));

    let outcome = runner.run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded, "{}", outcome.reason);
    assert_eq!(ids(&outcome.completed), BTreeSet::from(["a", "b", "c", "d"]));
    let work = temp.path().join("work");
    for file in ["a.py", "b.py", "c.py", "d.py"] {
        assert!(work.join(file).exists(), "{} missing", file);
    }

    // dependencies strictly before dependents
    let generated = oracle.generated();
    let pos = |t: &str| generated.iter().position(|g| g == t).unwrap();
    assert!(pos("a.py") < pos("b.py"));
    assert!(pos("b.py") < pos("c.py"));

    let checkpoint_path = outcome.checkpoint_path.unwrap();
    let checkpoint = load(&checkpoint_path);
    assert!(checkpoint.remaining_tasks().is_empty());
    assert_eq!(checkpoint.artifacts.len(), 4);

    let events = read_event_log(&checkpoint_path.parent().unwrap().join(EVENT_LOG_FILE)).unwrap();
    let kinds: Vec<&str> = events.iter().map(|(kind, _)| kind.as_str()).collect();
    assert_eq!(kinds.first(), Some(&"RunStarted"));
    assert!(kinds.contains(&"WaveCompleted"));
    assert!(kinds.contains(&"CheckpointSaved"));
    assert_eq!(kinds.last(), Some(&"RunCompleted"));
}

#[tokio::test]
async fn test_resume_runs_only_remaining_tasks() {
    let temp = tempdir().unwrap();
    let work = work_dir(&temp);
    std::fs::write(work.join("a.py"), "def a():\n    return 1\n").unwrap();

    let store = CheckpointStore::open(work.join(".convergent/checkpoints")).unwrap();
    let run_dir = store.create_run(chrono::Utc::now()).unwrap();
    let mut checkpoint = AgentCheckpoint::new(
        "run-abc",
        GOAL,
        vec![
            Task::new("a", "module a").with_target("a.py"),
            Task::new("b", "module b").with_target("b.py").with_depends_on(["a"]),
            Task::new("c", "module c").with_target("c.py").with_depends_on(["b"]),
        ],
        &work,
        TaskExecutionConfig::default(),
        ParallelConfig::default(),
    );
    checkpoint.completed_ids.push("a".to_string());
    let path = CheckpointStore::wave_path(&run_dir, 0);
    checkpoint.save(&store, &path).unwrap();

    let before: Vec<String> = checkpoint.remaining_tasks().iter().map(|t| t.id.clone()).collect();
    assert_eq!(before, vec!["b", "c"]);

    let oracle = Arc::new(Scripted::new(&[]));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Continue)));
    let outcome = runner.resume(&path).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded, "{}", outcome.reason);
    assert_eq!(oracle.generated(), vec!["b.py", "c.py"]);
    assert_eq!(ids(&outcome.completed), BTreeSet::from(["a", "b", "c"]));
    assert_eq!(outcome.run_id, "run-abc");

    // numbering continues after the file we resumed from
    let resumed_path = outcome.checkpoint_path.unwrap();
    assert_ne!(resumed_path, path);
    assert_eq!(resumed_path.parent(), path.parent());
}

#[tokio::test]
async fn test_continue_policy_skips_transitive_dependents() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&[&chain_plan()]).failing("b.py", Failure::Always));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Continue)));

    let outcome = runner.run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(outcome.failed, vec!["b"]);
    assert_eq!(outcome.skipped, vec!["c"]);
    assert_eq!(ids(&outcome.completed), BTreeSet::from(["a", "d"]));
    assert!(!oracle.generated().contains(&"c.py".to_string()));
    assert!(outcome.reason.contains("cannot write b.py"));
}

#[tokio::test]
async fn test_retry_policy_recovers_from_transient_failure() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&[&chain_plan()]).failing("b.py", Failure::Transient(1)));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Retry)));

    let outcome = runner.run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded, "{}", outcome.reason);
    let b_calls = oracle.generated().iter().filter(|t| *t == "b.py").count();
    assert_eq!(b_calls, 2);

    let checkpoint = load(&outcome.checkpoint_path.unwrap());
    let b = checkpoint.task("b").unwrap();
    assert_eq!(b.attempts, 2);
    assert_eq!(b.status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_retry_policy_gives_up_after_budget() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&[&chain_plan()]).failing("b.py", Failure::Transient(10)));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Retry)));

    let outcome = runner.run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    // first attempt plus max_retries_per_task
    let b_calls = oracle.generated().iter().filter(|t| *t == "b.py").count();
    assert_eq!(b_calls, 3);
    assert_eq!(outcome.skipped, vec!["c"]);
}

#[tokio::test]
async fn test_abort_policy_checkpoints_and_resume_finishes() {
    let temp = tempdir().unwrap();
    let plan = plan(&[("a", &[]), ("b", &["a"]), ("c", &["b"])]);
    let oracle = Arc::new(Scripted::new(&[&plan]).failing("b.py", Failure::Always));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Abort)));

    let outcome = runner.run(GOAL).await.unwrap();
    assert_eq!(outcome.status, RunStatus::Aborted);
    assert!(outcome.reason.contains("task b failed"));
    assert!(!oracle.generated().contains(&"c.py".to_string()));

    let path = outcome.checkpoint_path.clone().unwrap();
    let checkpoint = load(&path);
    assert_eq!(checkpoint.completed_ids, vec!["a"]);
    assert!(matches!(
        outcome.into_result(),
        Err(ExecError::Aborted { checkpoint: Some(_), .. })
    ));

    let healthy = Arc::new(Scripted::new(&[]));
    let runner = Runner::new(context(&temp, healthy.clone(), settings(FailurePolicy::Abort)));
    let resumed = runner.resume(&path).await.unwrap();

    assert_eq!(resumed.status, RunStatus::Succeeded, "{}", resumed.reason);
    assert_eq!(healthy.generated(), vec!["b.py", "c.py"]);
}

#[tokio::test]
async fn test_replan_policy_rediscovers_remaining_work() {
    let temp = tempdir().unwrap();
    let first = plan(&[("a", &[]), ("b", &["a"])]);
    let second = plan(&[("a", &[]), ("b2", &["a"])]);
    let oracle = Arc::new(Scripted::new(&[&first, &second]).failing("b.py", Failure::Always));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Replan)));

    let outcome = runner.run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Succeeded, "{}", outcome.reason);
    assert_eq!(ids(&outcome.completed), BTreeSet::from(["a", "b2"]));
    assert_eq!(oracle.generated().iter().filter(|t| *t == "a.py").count(), 1);

    let checkpoint = load(&outcome.checkpoint_path.unwrap());
    assert_eq!(checkpoint.context.get("replans"), Some(&serde_json::json!(1)));
    assert!(checkpoint.task("b").is_none());

    let prompts = oracle.discovery_prompts.lock().unwrap();
    assert_eq!(prompts.len(), 2);
    assert!(prompts[1].contains("- a (a.py)"));
    assert!(prompts[1].contains("cannot write b.py"));
}

#[tokio::test]
async fn test_cancelled_run_stops_before_first_wave() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&[&chain_plan()]));
    let cancel = CancelToken::new();
    cancel.cancel();
    let ctx = context(&temp, oracle.clone(), settings(FailurePolicy::Continue)).with_cancel(cancel);

    let outcome = Runner::new(ctx).run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert!(oracle.generated().is_empty());
    assert!(outcome.checkpoint_path.is_some());
}

#[tokio::test]
async fn test_discovery_failure_is_an_error() {
    let temp = tempdir().unwrap();
    let oracle = Arc::new(Scripted::new(&["I would rather not"]));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Continue)));

    let err = runner.run(GOAL).await.unwrap_err();
    assert!(matches!(err, ExecError::DiscoveryFailed { attempts: 3, .. }));
    assert!(oracle.generated().is_empty());
}

#[tokio::test]
async fn test_cyclic_plan_is_fatal() {
    let temp = tempdir().unwrap();
    let cyclic = plan(&[("a", &["b"]), ("b", &["a"])]);
    let oracle = Arc::new(Scripted::new(&[&cyclic]));
    let runner = Runner::new(context(&temp, oracle.clone(), settings(FailurePolicy::Continue)));

    let err = runner.run(GOAL).await.unwrap_err();
    assert!(matches!(err, ExecError::CyclicDependency { .. }));
    assert_eq!(oracle.discovery_prompts.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_after_task_gate_runs_once_dependencies_complete() {
    let temp = tempdir().unwrap();
    let plan = plan(&[("a", &[]), ("b", &["a"])]);
    let oracle = Arc::new(Scripted::new(&[&plan]));
    let gates = vec![
        ValidationGate::new("defines-b", GateType::Lint)
            .with_after_tasks(["a", "b"])
            .with_assertion(Assertion::Contains("def b".into())),
        ValidationGate::new("defines-z", GateType::Lint)
            .with_after_tasks(["a"])
            .with_assertion(Assertion::Contains("def z".into())),
    ];
    let ctx = context(&temp, oracle, settings(FailurePolicy::Continue)).with_gates(gates);

    let outcome = Runner::new(ctx).run(GOAL).await.unwrap();

    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(ids(&outcome.completed), BTreeSet::from(["a", "b"]));
    assert_eq!(outcome.gate_failures, vec!["defines-z"]);
    assert!(outcome.reason.contains("defines-z"));
}
