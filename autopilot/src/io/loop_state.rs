//! Persisted loop state (`.autopilot/state/loop_state.json`).
//!
//! The file is the crash-recoverable snapshot of a batch. Every write is
//! guarded by the run id: a process whose run was superseded by a newer one
//! can no longer overwrite the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{LoopStatus, QueueEntry};

/// Authoritative snapshot of one batch run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopState {
    /// Monotonically assigned per workspace.
    pub run_id: u64,
    pub status: LoopStatus,
    pub entries: Vec<QueueEntry>,
    /// Index into `entries` of the issue being processed.
    pub current_index: Option<usize>,
    pub heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub diagnostics: Vec<String>,
}

impl LoopState {
    pub fn new(run_id: u64, entries: Vec<QueueEntry>) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            status: LoopStatus::Running,
            entries,
            current_index: None,
            heartbeat: now,
            started_at: now,
            finished_at: None,
            diagnostics: Vec::new(),
        }
    }
}

/// Result of a guarded save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Written,
    /// The on-disk run id belongs to a newer run; nothing was written.
    Superseded { on_disk: u64 },
}

/// Load loop state from disk.
pub fn load_loop_state(path: &Path) -> Result<LoopState> {
    debug!(path = %path.display(), "loading loop state");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read loop state {}", path.display()))?;
    let state: LoopState = serde_json::from_str(&contents)
        .with_context(|| format!("parse loop state {}", path.display()))?;
    debug!(run_id = state.run_id, entries = state.entries.len(), "loop state loaded");
    Ok(state)
}

/// Load loop state if the file exists.
pub fn load_loop_state_if_exists(path: &Path) -> Result<Option<LoopState>> {
    if !path.exists() {
        return Ok(None);
    }
    load_loop_state(path).map(Some)
}

/// Run-id guarded writer for one loop invocation.
#[derive(Debug, Clone)]
pub struct LoopStore {
    path: PathBuf,
    run_id: u64,
}

impl LoopStore {
    /// Claim the next run id for `path` and write `entries` as its initial state.
    ///
    /// Returns the store and the state it wrote, plus the previous state if
    /// one existed.
    pub fn claim(
        path: &Path,
        entries: Vec<QueueEntry>,
    ) -> Result<(Self, LoopState, Option<LoopState>)> {
        let previous = match load_loop_state_if_exists(path) {
            Ok(previous) => previous,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "ignoring unreadable loop state");
                None
            }
        };
        let run_id = previous.as_ref().map_or(1, |state| state.run_id + 1);
        let state = LoopState::new(run_id, entries);
        write_loop_state(path, &state)?;
        debug!(run_id, "claimed loop run");
        Ok((
            Self {
                path: path.to_path_buf(),
                run_id,
            },
            state,
            previous,
        ))
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    /// Persist `state` (refreshing its heartbeat) unless a newer run owns the file.
    pub fn save(&self, state: &mut LoopState) -> Result<SaveOutcome> {
        if let Some(on_disk) = self.on_disk_run_id()?
            && on_disk != self.run_id
        {
            warn!(
                run_id = self.run_id,
                on_disk, "loop state owned by another run, not saving"
            );
            return Ok(SaveOutcome::Superseded { on_disk });
        }
        state.heartbeat = Utc::now();
        write_loop_state(&self.path, state)?;
        Ok(SaveOutcome::Written)
    }

    fn on_disk_run_id(&self) -> Result<Option<u64>> {
        #[derive(Deserialize)]
        struct RunIdOnly {
            run_id: u64,
        }

        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read loop state {}", self.path.display()))?;
        let head: RunIdOnly = serde_json::from_str(&contents)
            .with_context(|| format!("parse run id from {}", self.path.display()))?;
        Ok(Some(head.run_id))
    }
}

/// Atomically write loop state to disk (temp file + rename).
pub fn write_loop_state(path: &Path, state: &LoopState) -> Result<()> {
    debug!(path = %path.display(), run_id = state.run_id, "writing loop state");
    let mut buf = serde_json::to_string_pretty(state)?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Issue, QueueStatus};

    fn entry(id: &str) -> QueueEntry {
        QueueEntry::new(Issue {
            id: id.to_string(),
            title: id.to_string(),
            difficulty: 0,
            depends_on: Default::default(),
            body: None,
        })
    }

    #[test]
    fn claim_assigns_increasing_run_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/loop_state.json");

        let (first, state, previous) = LoopStore::claim(&path, vec![entry("a")]).expect("claim");
        assert_eq!(first.run_id(), 1);
        assert_eq!(state.status, LoopStatus::Running);
        assert!(previous.is_none());

        let (second, _, previous) = LoopStore::claim(&path, vec![entry("b")]).expect("claim");
        assert_eq!(second.run_id(), 2);
        assert_eq!(previous.expect("previous").entries[0].issue.id, "a");
    }

    #[test]
    fn save_persists_entries_and_refreshes_heartbeat() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop_state.json");
        let (store, mut state, _) = LoopStore::claim(&path, vec![entry("a")]).expect("claim");
        let before = state.heartbeat;

        state.entries[0].status = QueueStatus::Completed;
        assert_eq!(store.save(&mut state).expect("save"), SaveOutcome::Written);
        assert!(state.heartbeat >= before);

        let loaded = load_loop_state(&path).expect("load");
        assert_eq!(loaded, state);
    }

    #[test]
    fn stale_run_cannot_clobber_newer_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop_state.json");
        let (stale, mut stale_state, _) = LoopStore::claim(&path, vec![entry("a")]).expect("claim");
        let (_fresh, fresh_state, _) = LoopStore::claim(&path, vec![entry("b")]).expect("claim");

        stale_state.entries[0].status = QueueStatus::Failed;
        assert_eq!(
            stale.save(&mut stale_state).expect("save"),
            SaveOutcome::Superseded { on_disk: 2 }
        );
        assert_eq!(load_loop_state(&path).expect("load"), fresh_state);
    }

    #[test]
    fn claim_recovers_from_corrupt_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("loop_state.json");
        fs::write(&path, "{not json").expect("write");
        let (store, _, previous) = LoopStore::claim(&path, Vec::new()).expect("claim");
        assert_eq!(store.run_id(), 1);
        assert!(previous.is_none());
    }
}
