//! ArtifactGraph - validated, acyclic set of artifacts

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;
use tracing::debug;

use super::waves::{find_cycle, layer_waves};
use crate::domain::{ArtifactSpec, Task};
use crate::error::{ExecError, ExecResult};

/// Artifacts and their dependency edges
///
/// Only [`ArtifactGraph::build`] creates one, so every graph in hand is
/// acyclic and has no dangling edges.
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactGraph {
    nodes: BTreeMap<String, ArtifactSpec>,
    #[serde(skip)]
    waves: Vec<Vec<String>>,
}

impl ArtifactGraph {
    /// Validate and build
    ///
    /// Empty or duplicate ids and dependencies on unknown ids are
    /// `InvalidGraph`; any cycle is `CyclicDependency` with its path.
    pub fn build(specs: Vec<ArtifactSpec>) -> ExecResult<Self> {
        debug!(count = specs.len(), "ArtifactGraph::build: called");
        let mut nodes = BTreeMap::new();
        for spec in specs {
            if spec.id.trim().is_empty() {
                return Err(ExecError::InvalidGraph(format!(
                    "artifact with empty id: {}",
                    spec.description
                )));
            }
            if nodes.contains_key(&spec.id) {
                return Err(ExecError::InvalidGraph(format!("duplicate artifact id `{}`", spec.id)));
            }
            nodes.insert(spec.id.clone(), spec);
        }

        for spec in nodes.values() {
            if let Some(missing) = spec.requires.iter().find(|r| !nodes.contains_key(*r)) {
                return Err(ExecError::InvalidGraph(format!(
                    "artifact `{}` requires unknown artifact `{}`",
                    spec.id, missing
                )));
            }
        }

        let edges: BTreeMap<&str, BTreeSet<&str>> = nodes
            .values()
            .map(|s| (s.id.as_str(), s.requires.iter().map(String::as_str).collect()))
            .collect();
        if let Some(cycle) = find_cycle(&edges) {
            debug!(?cycle, "ArtifactGraph::build: cycle detected");
            return Err(ExecError::CyclicDependency { cycle });
        }

        let waves = layer_waves(nodes.values().map(|s| (s.id.as_str(), s.requires.as_slice())))?;
        Ok(Self { nodes, waves })
    }

    /// Graph of one artifact with no dependencies
    pub fn single(spec: ArtifactSpec) -> Self {
        let mut spec = spec;
        spec.requires.clear();
        Self {
            waves: vec![vec![spec.id.clone()]],
            nodes: BTreeMap::from([(spec.id.clone(), spec)]),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ArtifactSpec> {
        self.nodes.get(id)
    }

    /// Artifacts in id order
    pub fn specs(&self) -> impl Iterator<Item = &ArtifactSpec> {
        self.nodes.values()
    }

    /// Artifacts that require `id`
    pub fn dependents(&self, id: &str) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|s| s.requires.iter().any(|r| r == id))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Disjoint layers; every artifact depends only on earlier layers
    pub fn execution_waves(&self) -> Vec<Vec<String>> {
        self.waves.clone()
    }

    /// Number of waves
    pub fn max_depth(&self) -> usize {
        self.waves.len()
    }

    /// Artifacts nothing depends on: the final deliverables
    pub fn roots(&self) -> Vec<&str> {
        let required: HashSet<&str> = self.required_ids();
        self.nodes
            .keys()
            .map(String::as_str)
            .filter(|id| !required.contains(id))
            .collect()
    }

    /// Artifacts with neither dependencies nor dependents
    ///
    /// A single-artifact graph has no orphans.
    pub fn orphans(&self) -> Vec<&str> {
        if self.nodes.len() < 2 {
            return Vec::new();
        }
        let required = self.required_ids();
        self.nodes
            .values()
            .filter(|s| s.requires.is_empty() && !required.contains(s.id.as_str()))
            .map(|s| s.id.as_str())
            .collect()
    }

    /// Pending tasks in wave order
    pub fn to_tasks(&self) -> Vec<Task> {
        self.waves
            .iter()
            .flatten()
            .filter_map(|id| self.nodes.get(id))
            .map(Task::from)
            .collect()
    }

    fn required_ids(&self) -> HashSet<&str> {
        self.nodes
            .values()
            .flat_map(|s| s.requires.iter().map(String::as_str))
            .collect()
    }
}
