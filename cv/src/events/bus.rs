//! Event Bus - fan-out of run events to subscribers and hooks
//!
//! Subscribers receive events over a tokio broadcast channel. Hooks are
//! registered explicitly and called synchronously with the event kind and
//! its JSON payload.

use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::types::Event;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 4_096;

/// Synchronous observer registered on the bus
pub trait EventHook: Send + Sync {
    fn on_event(&self, kind: &str, payload: &serde_json::Value);
}

type HookList = Arc<RwLock<Vec<Arc<dyn EventHook>>>>;

/// Central event bus for one process
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    hooks: HookList,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "EventBus::new: creating event bus");
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            hooks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Register a hook; it sees every event emitted from now on
    pub fn register_hook(&self, hook: Arc<dyn EventHook>) {
        match self.hooks.write() {
            Ok(mut hooks) => hooks.push(hook),
            Err(poisoned) => poisoned.into_inner().push(hook),
        }
        debug!("EventBus::register_hook: hook registered");
    }

    pub fn emit(&self, event: Event) {
        dispatch(&self.tx, &self.hooks, event);
    }

    /// Events emitted before subscribing are not received
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        debug!("EventBus::subscribe: new subscriber");
        self.tx.subscribe()
    }

    /// Emitter bound to one run
    pub fn emitter_for(&self, run_id: impl Into<String>) -> EventEmitter {
        let run_id = run_id.into();
        debug!(%run_id, "EventBus::emitter_for: creating emitter");
        EventEmitter {
            tx: self.tx.clone(),
            hooks: self.hooks.clone(),
            run_id,
            task_id: String::new(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn dispatch(tx: &broadcast::Sender<Event>, hooks: &HookList, event: Event) {
    let hooks = match hooks.read() {
        Ok(h) => h.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    if !hooks.is_empty() {
        match serde_json::to_value(&event) {
            Ok(payload) => {
                for hook in &hooks {
                    hook.on_event(event.kind(), &payload);
                }
            }
            Err(e) => warn!(kind = event.kind(), error = %e, "Failed to serialize event for hooks"),
        }
    }
    // No subscribers is fine
    let _ = tx.send(event);
}

/// Cheap-to-clone handle that stamps run (and optionally task) ids on events
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<Event>,
    hooks: HookList,
    run_id: String,
    task_id: String,
}

impl EventEmitter {
    /// Emitter that goes nowhere, for callers without a bus
    pub fn detached(run_id: impl Into<String>) -> Self {
        EventBus::new(16).emitter_for(run_id)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Same run, scoped to one task
    pub fn for_task(&self, task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            ..self.clone()
        }
    }

    pub fn emit(&self, event: Event) {
        debug!(kind = event.kind(), "EventEmitter::emit");
        dispatch(&self.tx, &self.hooks, event);
    }

    pub fn warning(&self, context: &str, message: impl Into<String>) {
        self.emit(Event::Warning {
            run_id: self.run_id.clone(),
            context: context.to_string(),
            message: message.into(),
        });
    }
}
