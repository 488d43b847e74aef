//! Domain types shared across the execution core

mod artifact;
mod id;
mod task;

pub use artifact::{ArtifactSpec, TaskMode};
pub use id::{generate_id, slugify};
pub use task::{Task, TaskStatus};
