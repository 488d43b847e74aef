//! ArtifactSpec - one unit of work discovered from a goal

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// How a task turns into an artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    /// Oracle writes the target file, then the convergence loop stabilizes it
    #[default]
    Generate,
    /// Groups its dependencies; done when every dependency's artifact exists
    Composite,
    /// Runs the gate cascade once over existing files, never edits them
    Verify,
}

impl std::fmt::Display for TaskMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Generate => write!(f, "generate"),
            Self::Composite => write!(f, "composite"),
            Self::Verify => write!(f, "verify"),
        }
    }
}

/// Immutable description of an artifact the goal needs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Unique id within the graph
    pub id: String,

    /// What the artifact is
    pub description: String,

    /// What the artifact must satisfy (interface, behaviour)
    #[serde(default)]
    pub contract: String,

    /// File this artifact is written to, relative to the workspace
    #[serde(default, alias = "produces_file", alias = "target")]
    pub produces: Option<PathBuf>,

    /// Ids of artifacts that must exist first
    #[serde(default, alias = "depends_on")]
    pub requires: Vec<String>,

    #[serde(default)]
    pub mode: TaskMode,
}

impl ArtifactSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            contract: String::new(),
            produces: None,
            requires: Vec::new(),
            mode: TaskMode::Generate,
        }
    }

    pub fn with_contract(mut self, contract: impl Into<String>) -> Self {
        self.contract = contract.into();
        self
    }

    pub fn with_produces(mut self, path: impl Into<PathBuf>) -> Self {
        self.produces = Some(path.into());
        self
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_mode(mut self, mode: TaskMode) -> Self {
        self.mode = mode;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let spec = ArtifactSpec::new("api", "HTTP handlers")
            .with_contract("exposes GET /health")
            .with_produces("src/api.rs")
            .with_requires(["models", "db"]);

        assert_eq!(spec.id, "api");
        assert_eq!(spec.requires, vec!["models", "db"]);
        assert_eq!(spec.produces, Some(PathBuf::from("src/api.rs")));
        assert_eq!(spec.mode, TaskMode::Generate);
    }

    #[test]
    fn test_deserialize_accepts_aliases_and_defaults() {
        let json = r#"{"id": "db", "description": "storage", "produces_file": "db.py", "depends_on": ["models"]}"#;
        let spec: ArtifactSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.produces, Some(PathBuf::from("db.py")));
        assert_eq!(spec.requires, vec!["models"]);
        assert_eq!(spec.contract, "");
        assert_eq!(spec.mode, TaskMode::Generate);
    }

    #[test]
    fn test_mode_serde() {
        let mode: TaskMode = serde_json::from_str("\"composite\"").unwrap();
        assert_eq!(mode, TaskMode::Composite);
        assert_eq!(TaskMode::Verify.to_string(), "verify");
    }
}
