//! Product event log for a run (`.autopilot/runs/<run-id>/events.jsonl`).
//!
//! Unlike tracing output this log is always written and is meant to be read
//! by people and tools after the run. Write failures are logged and ignored.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

/// Append-only JSONL sink shared by everything in one run.
#[derive(Debug)]
pub struct EventLog {
    path: Option<PathBuf>,
    file: Mutex<Option<File>>,
}

impl EventLog {
    /// Open (or create) the log at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create event log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            file: Mutex::new(Some(file)),
        })
    }

    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self {
            path: None,
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append `{ts, kind, ...payload}` as one line.
    pub fn record<T: Serialize>(&self, kind: &str, payload: &T) {
        let mut line = json!({
            "ts": Utc::now().to_rfc3339(),
            "kind": kind,
        });
        match serde_json::to_value(payload) {
            Ok(Value::Object(fields)) => {
                if let Value::Object(map) = &mut line {
                    map.extend(fields);
                }
            }
            Ok(other) => line["payload"] = other,
            Err(err) => {
                warn!(kind, err = %err, "failed to serialize event");
                return;
            }
        }

        let Ok(mut guard) = self.file.lock() else {
            warn!(kind, "event log lock poisoned");
            return;
        };
        if let Some(file) = guard.as_mut()
            && let Err(err) = writeln!(file, "{line}")
        {
            warn!(kind, err = %err, "failed to append event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_one_json_object_per_line() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("runs/1/events.jsonl");
        let log = EventLog::open(&path).expect("open");
        log.record("stage_start", &json!({"stage": "plan"}));
        log.record("note", &"plain string");

        let contents = fs::read_to_string(&path).expect("read");
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "stage_start");
        assert_eq!(lines[0]["stage"], "plan");
        assert_eq!(lines[1]["payload"], "plain string");
    }

    #[test]
    fn disabled_log_accepts_records() {
        let log = EventLog::disabled();
        log.record("anything", &json!({}));
        assert!(log.path().is_none());
    }
}
