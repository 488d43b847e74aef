//! Artifact graph and dependency scheduling
//!
//! Discovery turns a goal into an [`ArtifactGraph`]; the graph's execution
//! waves are the schedule. The same layering function orders gates inside a
//! cascade and the remaining tasks of a resumed run.

mod artifact_graph;
mod discovery;
mod waves;

pub use artifact_graph::ArtifactGraph;
pub use discovery::{
    DiscoveryConfig, Discoverer, TRIVIAL_ARTIFACT_ID, is_trivial, parse_artifacts, trivial_artifact,
};
pub use waves::layer_waves;
