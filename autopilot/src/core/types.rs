//! Shared deterministic types for the scheduling core.
//!
//! These types define the stable contracts between the loop, the persisted
//! loop state, and the stage pipeline. They carry no I/O.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A unit of work for the loop, produced by an issue source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    pub title: String,
    /// Lower runs first when no issue declares dependencies.
    #[serde(default)]
    pub difficulty: u32,
    /// Declared order matters: the first completed dependency supplies the base branch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Scheduling status of a single queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    Pending,
    InProgress,
    Deferred,
    Completed,
    Failed,
    Skipped,
}

impl QueueStatus {
    /// True for outcomes that count as "this dependency did not succeed".
    pub fn is_unsuccessful(self) -> bool {
        matches!(self, QueueStatus::Failed | QueueStatus::Skipped)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Deferred => "deferred",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Skipped => "skipped",
        }
    }
}

/// Mutable per-issue scheduling record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub issue: Issue,
    pub status: QueueStatus,
    pub branch: Option<String>,
    pub pr: Option<String>,
    pub error: Option<String>,
    pub base_branch: Option<String>,
    /// Number of times the entry entered `in_progress`.
    #[serde(default)]
    pub passes: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    pub fn new(issue: Issue) -> Self {
        Self {
            issue,
            status: QueueStatus::Pending,
            branch: None,
            pr: None,
            error: None,
            base_branch: None,
            passes: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall status of a loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    Running,
    Completed,
    Cancelled,
}

/// Outcome of a single unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Ok,
    Error,
    Skipped,
}

/// Terminal outcome recorded for a processed issue.
///
/// Only lives in memory for the duration of one loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueOutcome {
    pub status: QueueStatus,
    pub branch: Option<String>,
}

/// Aggregate counts for a finished batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub deferred: usize,
    pub pending: usize,
}

impl OutcomeCounts {
    pub fn tally(entries: &[QueueEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.status {
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
                QueueStatus::Skipped => counts.skipped += 1,
                QueueStatus::Deferred => counts.deferred += 1,
                QueueStatus::Pending | QueueStatus::InProgress => counts.pending += 1,
            }
        }
        counts
    }
}
