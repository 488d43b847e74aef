//! Built-in event hooks

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use tracing::{debug, warn};

use super::bus::EventHook;

/// Appends every event to a JSONL file
pub struct JsonlHook {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlHook {
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), "JsonlHook::create");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventHook for JsonlHook {
    fn on_event(&self, kind: &str, payload: &serde_json::Value) {
        let line = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
            "event": payload,
        });
        let mut writer = match self.writer.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(writer, "{}", line).and_then(|_| writer.flush()) {
            warn!(path = %self.path.display(), error = %e, "JsonlHook: failed to write event");
        }
    }
}

/// Mirrors events into the tracing log
pub struct TracingHook;

impl EventHook for TracingHook {
    fn on_event(&self, kind: &str, payload: &serde_json::Value) {
        tracing::info!(target: "convergent::events", kind, %payload, "event");
    }
}

/// Read back a JSONL event log as (kind, payload) pairs
pub fn read_event_log(path: &Path) -> std::io::Result<Vec<(String, serde_json::Value)>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
        .map(|mut v| {
            let kind = v["kind"].as_str().unwrap_or_default().to_string();
            (kind, v["event"].take())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, EventBus};
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_jsonl_hook_writes_lines() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("run/events.jsonl");
        let bus = EventBus::with_default_capacity();
        bus.register_hook(Arc::new(JsonlHook::create(&path).unwrap()));

        let emitter = bus.emitter_for("run-9");
        emitter.emit(Event::RunStarted {
            run_id: "run-9".to_string(),
            goal: "demo".to_string(),
            resumed: false,
        });
        emitter.warning("ctx", "careful");

        let events = read_event_log(&path).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, "RunStarted");
        assert_eq!(events[0].1["goal"], "demo");
        assert_eq!(events[1].0, "Warning");
    }
}
