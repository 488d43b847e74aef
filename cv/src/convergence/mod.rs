//! Convergence - iterative repair until every enabled gate passes
//!
//! ```text
//!             ┌──────────── repair applied ────────────┐
//!             ▼                                         │
//!   RUNNING ─▶ validate ─▶ all pass? ─yes─▶ STABLE      │
//!                             │ no                      │
//!                             ▼                         │
//!          max iterations / stuck / budget ─▶ ESCALATED │
//!          wall clock / cancel            ─▶ TIMEOUT    │
//!                             │ otherwise               │
//!                             └──▶ Oracle generate_fix ─┘
//! ```

mod config;
mod engine;
mod signature;

pub use config::ConvergenceConfig;
pub use engine::{ConvergenceIteration, ConvergenceLoop, ConvergenceResult, ConvergenceStatus};
pub use signature::failure_signature;
