//! Shared state threaded by reference through one batch run.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tracing::{debug, info};

use crate::agent::ExecOptions;
use crate::agent::pool::{AgentPool, Secrets};
use crate::io::config::{AutopilotConfig, Scope};
use crate::io::event_log::EventLog;
use crate::io::init::AutopilotPaths;
use crate::pipeline::unit::sanitize;

/// Cooperative cancellation and pause signal.
///
/// Checked at stage boundaries and at the top of each issue. An in-flight
/// worker invocation is never interrupted.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    paused: Mutex<bool>,
    changed: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        // Wake anything parked in `wait_while_paused`.
        let _guard = self.paused.lock();
        self.changed.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn pause(&self) {
        self.set_paused(true);
    }

    pub fn resume(&self) {
        self.set_paused(false);
    }

    pub fn is_paused(&self) -> bool {
        match self.paused.lock() {
            Ok(paused) => *paused,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_paused(&self, value: bool) {
        match self.paused.lock() {
            Ok(mut paused) => *paused = value,
            Err(poisoned) => *poisoned.into_inner() = value,
        }
        self.changed.notify_all();
    }

    /// Block while paused. Returns `true` if the token was cancelled.
    pub fn wait_while_paused(&self) -> bool {
        let mut paused = match self.paused.lock() {
            Ok(paused) => paused,
            Err(poisoned) => poisoned.into_inner(),
        };
        while *paused && !self.is_cancelled() {
            paused = match self.changed.wait_timeout(paused, Duration::from_millis(500)) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        self.is_cancelled()
    }
}

/// Run-scoped context shared by every unit in a batch.
pub struct RunContext {
    pub workspace_root: PathBuf,
    pub config: Arc<AutopilotConfig>,
    pub pool: AgentPool,
    pub events: EventLog,
    pub cancel: Arc<CancelToken>,
    pub secrets: Secrets,
    pub artifacts_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl RunContext {
    pub fn new(
        paths: &AutopilotPaths,
        config: Arc<AutopilotConfig>,
        pool: AgentPool,
        events: EventLog,
    ) -> Self {
        Self {
            workspace_root: paths.root.clone(),
            config,
            pool,
            events,
            cancel: Arc::new(CancelToken::new()),
            secrets: Secrets::new(),
            artifacts_dir: paths.artifacts_dir.clone(),
            scratch_dir: paths.scratch_dir.clone(),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<CancelToken>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_secrets(mut self, secrets: Secrets) -> Self {
        self.secrets = secrets;
        self
    }

    /// Active repository root.
    pub fn repo_root(&self) -> PathBuf {
        self.pool.active_root()
    }

    /// Switch the active repository root, releasing handles bound elsewhere.
    pub fn set_repo_root(&self, root: &Path) -> Result<()> {
        if root == self.repo_root() {
            return Ok(());
        }
        let evicted = self.pool.update_context(root)?;
        info!(root = %root.display(), evicted, "repository root changed");
        self.events.record(
            "repo_root_changed",
            &json!({"root": root.display().to_string(), "evicted": evicted}),
        );
        Ok(())
    }

    pub fn scope_dir(&self, scope: Scope) -> PathBuf {
        match scope {
            Scope::Workspace => self.workspace_root.clone(),
            Scope::Repository => self.repo_root(),
        }
    }

    /// Invocation options with the configured worker timeout.
    pub fn exec_options(&self, scope: Scope) -> ExecOptions {
        let mut options = ExecOptions::new(Duration::from_secs(
            self.config.loop_settings.agent_timeout_secs,
        ));
        options.cwd = Some(self.scope_dir(scope));
        debug!(timeout_secs = options.timeout.as_secs(), "exec options");
        options
    }

    /// Live output file for one stage of one issue, beside the run's event log.
    ///
    /// `None` when the event log is disabled.
    pub fn stream_path(&self, issue_id: &str, stage: &str) -> Option<PathBuf> {
        let run_dir = self.events.path()?.parent()?;
        Some(
            run_dir
                .join(sanitize(issue_id))
                .join(format!("{}.stream", sanitize(stage))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn pause_blocks_until_resumed() {
        let token = Arc::new(CancelToken::new());
        token.pause();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_while_paused())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());
        token.resume();
        assert!(!waiter.join().expect("join"));
    }

    #[test]
    fn cancel_releases_paused_waiters() {
        let token = Arc::new(CancelToken::new());
        token.pause();
        let waiter = {
            let token = token.clone();
            thread::spawn(move || token.wait_while_paused())
        };
        token.cancel();
        assert!(waiter.join().expect("join"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn unpaused_wait_returns_immediately() {
        let token = CancelToken::new();
        assert!(!token.wait_while_paused());
    }
}
