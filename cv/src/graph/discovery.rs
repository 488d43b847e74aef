//! Discoverer - turns a goal into a validated ArtifactGraph
//!
//! Short single-clause goals skip the Oracle entirely. Everything else is a
//! bounded conversation: malformed or empty answers are re-prompted with a
//! hint, while structural problems (too many artifacts, cycles) end discovery
//! at once.

use std::path::PathBuf;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::ArtifactGraph;
use crate::domain::ArtifactSpec;
use crate::error::{ExecError, ExecResult};
use crate::events::{Event, EventEmitter};
use crate::oracle::{GenerateOptions, Oracle, PromptLibrary, TemplateName, extract_json};

/// Id of the single artifact of a trivial goal
pub const TRIVIAL_ARTIFACT_ID: &str = "main";

static MULTI_CLAUSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)\b(and|then|also|plus|after)\b|[,;\n]|^\s*(\d+[.)]|[-*])\s").expect("valid clause regex")
});

static FILENAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([\w./-]*\w\.(?:py|rs|js|ts|go|java|rb|sh|md|txt|json|ya?ml|toml|html|css))\b")
        .expect("valid filename regex")
});

/// Discovery limits and Oracle options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Oracle attempts before giving up
    #[serde(rename = "max-retries")]
    pub max_retries: u32,

    #[serde(rename = "max-artifacts")]
    pub max_artifacts: usize,

    /// Most waves a graph may have
    #[serde(rename = "max-depth")]
    pub max_depth: usize,

    /// Goals with at most this many words and a single clause skip the Oracle (0 disables)
    #[serde(rename = "trivial-word-limit")]
    pub trivial_word_limit: usize,

    /// Target of a trivial goal that names no file
    #[serde(rename = "default-target")]
    pub default_target: PathBuf,

    pub model: Option<String>,

    pub temperature: Option<f32>,

    #[serde(rename = "max-tokens")]
    pub max_tokens: Option<u32>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            max_artifacts: 50,
            max_depth: 10,
            trivial_word_limit: 12,
            default_target: PathBuf::from("output.py"),
            model: None,
            temperature: Some(0.3),
            max_tokens: Some(3000),
        }
    }
}

#[derive(Serialize)]
struct DiscoverPrompt<'a> {
    goal: &'a str,
    context: &'a str,
    max_artifacts: usize,
    hint: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DiscoveryReply {
    List(Vec<ArtifactSpec>),
    Wrapped { artifacts: Vec<ArtifactSpec> },
}

/// Goal decomposition over the Oracle
pub struct Discoverer {
    oracle: Arc<dyn Oracle>,
    prompts: Arc<PromptLibrary>,
    config: DiscoveryConfig,
}

impl Discoverer {
    pub fn new(oracle: Arc<dyn Oracle>, prompts: Arc<PromptLibrary>, config: DiscoveryConfig) -> Self {
        Self {
            oracle,
            prompts,
            config,
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Decompose `goal` into an acyclic artifact graph
    pub async fn discover(&self, goal: &str, context: &str, events: &EventEmitter) -> ExecResult<ArtifactGraph> {
        debug!(%goal, "Discoverer::discover: called");
        events.emit(Event::DiscoveryStarted {
            run_id: events.run_id().to_string(),
            goal: goal.to_string(),
        });

        if is_trivial(goal, self.config.trivial_word_limit) {
            info!(%goal, "Discoverer: trivial goal, single artifact");
            let graph = ArtifactGraph::single(trivial_artifact(goal, &self.config.default_target));
            self.completed(&graph, events);
            return Ok(graph);
        }

        let attempts = self.config.max_retries.max(1);
        let options = GenerateOptions {
            model: self.config.model.clone(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let mut hint: Option<String> = None;
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            let prompt = self.prompts.render(
                TemplateName::Discover,
                &DiscoverPrompt {
                    goal,
                    context,
                    max_artifacts: self.config.max_artifacts,
                    hint: hint.take(),
                },
            )?;

            let rejected = match self.oracle.generate(&prompt, &options).await {
                Ok(generation) => match self.evaluate(&generation.content) {
                    Ok(graph) => {
                        events.emit(Event::DiscoveryAttempt {
                            run_id: events.run_id().to_string(),
                            attempt,
                            error: None,
                        });
                        self.report_orphans(&graph, events);
                        self.completed(&graph, events);
                        return Ok(graph);
                    }
                    Err(Rejection::Fatal(e)) => {
                        warn!(attempt, error = %e, "Discoverer: fatal discovery error");
                        events.emit(Event::DiscoveryAttempt {
                            run_id: events.run_id().to_string(),
                            attempt,
                            error: Some(e.to_string()),
                        });
                        return Err(e);
                    }
                    Err(Rejection::Retry(reason)) => {
                        hint = Some(reason.clone());
                        reason
                    }
                },
                Err(e) => format!("oracle error: {}", e),
            };

            warn!(attempt, reason = %rejected, "Discoverer: attempt rejected");
            events.emit(Event::DiscoveryAttempt {
                run_id: events.run_id().to_string(),
                attempt,
                error: Some(rejected.clone()),
            });
            last_error = rejected;
        }

        Err(ExecError::DiscoveryFailed {
            attempts,
            reason: last_error,
        })
    }

    fn evaluate(&self, reply: &str) -> Result<ArtifactGraph, Rejection> {
        let specs = parse_artifacts(reply).map_err(Rejection::Retry)?;
        if specs.is_empty() {
            return Err(Rejection::Retry(
                "no artifacts found. Be more concrete about which files or components must be created".to_string(),
            ));
        }
        if specs.len() > self.config.max_artifacts {
            return Err(Rejection::Fatal(ExecError::GraphExplosion {
                count: specs.len(),
                limit: self.config.max_artifacts,
            }));
        }

        let graph = match ArtifactGraph::build(specs) {
            Ok(graph) => graph,
            Err(ExecError::InvalidGraph(reason)) => return Err(Rejection::Retry(reason)),
            Err(e) => return Err(Rejection::Fatal(e)),
        };

        let depth = graph.max_depth();
        if depth > self.config.max_depth {
            return Err(Rejection::Fatal(ExecError::DiscoveryFailed {
                attempts: 1,
                reason: format!(
                    "graph depth {} exceeds limit {}; break the goal into smaller goals",
                    depth, self.config.max_depth
                ),
            }));
        }
        Ok(graph)
    }

    fn report_orphans(&self, graph: &ArtifactGraph, events: &EventEmitter) {
        let orphans = graph.orphans();
        if !orphans.is_empty() {
            info!(count = orphans.len(), ids = ?orphans, "Discoverer: orphaned artifacts");
            events.warning(
                "discovery",
                format!("artifacts not connected to the graph: {}", orphans.join(", ")),
            );
        }
    }

    fn completed(&self, graph: &ArtifactGraph, events: &EventEmitter) {
        events.emit(Event::DiscoveryCompleted {
            run_id: events.run_id().to_string(),
            artifacts: graph.len(),
            waves: graph.max_depth(),
        });
    }
}

enum Rejection {
    /// Worth asking again with this hint
    Retry(String),
    Fatal(ExecError),
}

/// Short, single-clause goal that needs no decomposition
pub fn is_trivial(goal: &str, word_limit: usize) -> bool {
    if word_limit == 0 {
        return false;
    }
    let words = goal.split_whitespace().count();
    words > 0 && words <= word_limit && !MULTI_CLAUSE_RE.is_match(goal.trim())
}

/// Single artifact for a trivial goal; the goal doubles as the contract
pub fn trivial_artifact(goal: &str, default_target: &std::path::Path) -> ArtifactSpec {
    let target = FILENAME_RE
        .captures(goal)
        .and_then(|c| c.get(1))
        .map(|m| PathBuf::from(m.as_str()))
        .unwrap_or_else(|| default_target.to_path_buf());
    ArtifactSpec::new(TRIVIAL_ARTIFACT_ID, goal)
        .with_contract(goal)
        .with_produces(target)
}

/// Artifact list from a discovery reply: a bare array or `{"artifacts": [...]}`
pub fn parse_artifacts(reply: &str) -> Result<Vec<ArtifactSpec>, String> {
    let json = extract_json(reply).ok_or_else(|| "reply contained no JSON array of artifacts".to_string())?;
    match serde_json::from_str::<DiscoveryReply>(json) {
        Ok(DiscoveryReply::List(specs)) | Ok(DiscoveryReply::Wrapped { artifacts: specs }) => Ok(specs),
        Err(e) => Err(format!("artifact JSON did not match the expected shape: {}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use crate::oracle::{Generation, OracleError};

    struct Scripted {
        replies: Mutex<VecDeque<Result<String, OracleError>>>,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, OracleError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Oracle for Scripted {
        async fn generate(&self, _prompt: &str, _options: &GenerateOptions) -> Result<Generation, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = self
                .replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))?;
            Ok(Generation {
                content: reply,
                ..Default::default()
            })
        }
    }

    fn discoverer(oracle: Arc<Scripted>, config: DiscoveryConfig) -> Discoverer {
        Discoverer::new(oracle, Arc::new(PromptLibrary::embedded()), config)
    }

    fn non_trivial() -> DiscoveryConfig {
        DiscoveryConfig {
            trivial_word_limit: 0,
            ..Default::default()
        }
    }

    const GOOD: &str = r#"Here is the plan:
```json
[
  {"id": "schema", "description": "DB schema", "produces": "schema.sql"},
  {"id": "api", "description": "REST API", "requires": ["schema"], "produces": "api.py"}
]
```"#;

    #[test]
    fn test_is_trivial() {
        assert!(is_trivial("Write hello.py that prints hello", 12));
        assert!(!is_trivial("Build an API and a frontend", 12));
        assert!(!is_trivial("Build:\n- api\n- frontend", 12));
        assert!(!is_trivial("one two three four", 3));
        assert!(!is_trivial("Write hello.py", 0));
        assert!(!is_trivial("   ", 12));
    }

    #[test]
    fn test_trivial_artifact_extracts_filename() {
        let spec = trivial_artifact("Create src/main.rs printing hi.", std::path::Path::new("output.py"));
        assert_eq!(spec.id, "main");
        assert_eq!(spec.produces, Some(PathBuf::from("src/main.rs")));
        assert_eq!(spec.contract, "Create src/main.rs printing hi.");

        let spec = trivial_artifact("Print a greeting", std::path::Path::new("output.py"));
        assert_eq!(spec.produces, Some(PathBuf::from("output.py")));
    }

    #[test]
    fn test_parse_artifacts_shapes() {
        assert_eq!(parse_artifacts(GOOD).unwrap().len(), 2);
        let wrapped = r#"{"artifacts": [{"id": "a", "description": "A"}]}"#;
        assert_eq!(parse_artifacts(wrapped).unwrap()[0].id, "a");
        assert!(parse_artifacts("I could not decide").is_err());
        assert!(parse_artifacts(r#"[{"name": "a"}]"#).is_err());
    }

    #[tokio::test]
    async fn test_trivial_goal_skips_oracle() {
        let oracle = Scripted::new(vec![]);
        let graph = discoverer(oracle.clone(), DiscoveryConfig::default())
            .discover("Write hello.py", "", &EventEmitter::detached("t"))
            .await
            .unwrap();
        assert_eq!(graph.len(), 1);
        assert_eq!(oracle.calls(), 0);
    }

    #[tokio::test]
    async fn test_discovery_builds_graph() {
        let oracle = Scripted::new(vec![Ok(GOOD.to_string())]);
        let graph = discoverer(oracle.clone(), non_trivial())
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap();
        assert_eq!(graph.execution_waves(), vec![vec!["schema"], vec!["api"]]);
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_malformed_reply_is_retried() {
        let oracle = Scripted::new(vec![
            Ok("no idea".to_string()),
            Ok("[]".to_string()),
            Ok(GOOD.to_string()),
        ]);
        let graph = discoverer(oracle.clone(), non_trivial())
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let oracle = Scripted::new(vec![
            Ok("nope".to_string()),
            Err(OracleError::Unavailable("down".to_string())),
            Ok("still nope".to_string()),
            Ok(GOOD.to_string()),
        ]);
        let err = discoverer(oracle.clone(), non_trivial())
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::DiscoveryFailed { attempts: 3, .. }));
        assert_eq!(oracle.calls(), 3);
    }

    #[tokio::test]
    async fn test_explosion_is_fatal() {
        let specs: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"id": "a{}", "description": "x"}}"#, i))
            .collect();
        let oracle = Scripted::new(vec![Ok(format!("[{}]", specs.join(",")))]);
        let config = DiscoveryConfig {
            max_artifacts: 4,
            ..non_trivial()
        };
        let err = discoverer(oracle.clone(), config)
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::GraphExplosion { count: 5, limit: 4 }));
        assert!(err.is_fatal());
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_cycle_is_fatal() {
        let reply = r#"[{"id": "a", "description": "A", "requires": ["b"]},
                        {"id": "b", "description": "B", "requires": ["a"]}]"#;
        let oracle = Scripted::new(vec![Ok(reply.to_string()), Ok(GOOD.to_string())]);
        let err = discoverer(oracle.clone(), non_trivial())
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::CyclicDependency { .. }));
        assert_eq!(oracle.calls(), 1);
    }

    #[tokio::test]
    async fn test_dangling_dependency_is_retried() {
        let reply = r#"[{"id": "a", "description": "A", "requires": ["ghost"]}]"#;
        let oracle = Scripted::new(vec![Ok(reply.to_string()), Ok(GOOD.to_string())]);
        let graph = discoverer(oracle.clone(), non_trivial())
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap();
        assert_eq!(graph.len(), 2);
        assert_eq!(oracle.calls(), 2);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let config = DiscoveryConfig {
            max_depth: 1,
            ..non_trivial()
        };
        let oracle = Scripted::new(vec![Ok(GOOD.to_string())]);
        let err = discoverer(oracle, config)
            .discover("Build a service", "", &EventEmitter::detached("t"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::DiscoveryFailed { reason, .. } if reason.contains("depth")));
    }
}
