//! Event bus for run observability
//!
//! Every significant step of a run emits an [`Event`]. Consumers either
//! subscribe to the broadcast channel or register an [`EventHook`] at startup.
//!
//! ```text
//!   Discoverer   Runner   GateCascade   ConvergenceLoop   CheckpointWriter
//!        │          │          │               │                 │
//!        └──────────┴──────────┴───────┬───────┴─────────────────┘
//!                                      ▼
//!                                  EventBus
//!                          ┌───────────┼────────────┐
//!                          ▼           ▼            ▼
//!                     subscribers  JsonlHook   TracingHook
//! ```

mod bus;
mod hooks;
mod types;

pub use bus::{DEFAULT_CHANNEL_CAPACITY, EventBus, EventEmitter, EventHook};
pub use hooks::{JsonlHook, TracingHook, read_event_log};
pub use types::{Event, EventLogEntry};
