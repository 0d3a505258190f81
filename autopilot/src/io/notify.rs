//! Lifecycle notifications dispatched to external collaborators.
//!
//! Delivery is best-effort: callers log failures and move on.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::core::types::OutcomeCounts;

/// Named lifecycle event with a small payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LoopEvent {
    LoopStart {
        run_id: u64,
        issues: usize,
    },
    LoopComplete {
        run_id: u64,
        counts: OutcomeCounts,
        cancelled: bool,
    },
    IssueStart {
        issue_id: String,
        retry_pass: bool,
    },
    IssueComplete {
        issue_id: String,
        branch: Option<String>,
        pr: Option<String>,
    },
    IssueFailed {
        issue_id: String,
        error: String,
    },
    IssueSkipped {
        issue_id: String,
        reason: String,
    },
    IssueDeferred {
        issue_id: String,
        reason: String,
    },
}

impl LoopEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LoopEvent::LoopStart { .. } => "loop_start",
            LoopEvent::LoopComplete { .. } => "loop_complete",
            LoopEvent::IssueStart { .. } => "issue_start",
            LoopEvent::IssueComplete { .. } => "issue_complete",
            LoopEvent::IssueFailed { .. } => "issue_failed",
            LoopEvent::IssueSkipped { .. } => "issue_skipped",
            LoopEvent::IssueDeferred { .. } => "issue_deferred",
        }
    }
}

/// Receives loop lifecycle events.
pub trait Notifier {
    fn notify(&self, event: &LoopEvent) -> Result<()>;
}

/// Emits events as tracing records.
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &LoopEvent) -> Result<()> {
        info!(event = event.name(), payload = ?event, "loop event");
        Ok(())
    }
}

/// Posts each event as JSON to a webhook.
pub struct WebhookNotifier {
    url: String,
    agent: ureq::Agent,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .timeout(Duration::from_secs(10))
            .build();
        Self {
            url: url.into(),
            agent,
        }
    }
}

impl Notifier for WebhookNotifier {
    fn notify(&self, event: &LoopEvent) -> Result<()> {
        self.agent
            .post(&self.url)
            .send_json(event)
            .with_context(|| format!("post {} to {}", event.name(), self.url))?;
        Ok(())
    }
}

/// Fans an event out to every notifier; one failure does not stop the others.
#[derive(Default)]
pub struct Notifiers {
    sinks: Vec<Box<dyn Notifier + Send + Sync>>,
}

impl Notifiers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Notifier + Send + Sync + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl Notifier for Notifiers {
    fn notify(&self, event: &LoopEvent) -> Result<()> {
        for sink in &self.sinks {
            if let Err(err) = sink.notify(event) {
                warn!(event = event.name(), err = %format!("{err:#}"), "notification failed");
            }
        }
        Ok(())
    }
}
