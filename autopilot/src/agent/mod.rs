//! Worker handles: the uniform invocation contract, its transports, the
//! retry/fallback decorator and the pool that owns them.
//!
//! Everything above this module talks to workers only through
//! [`AgentHandle`]; no caller depends on a concrete transport.

pub mod http;
pub mod pool;
pub mod process;
pub mod resilient;
pub mod tool_server;

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::core::backoff::RetryPolicy;
use crate::core::classifier::{ErrorKind, is_rate_limit_message};

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct ExecOptions {
    pub timeout: Duration,
    /// Conversation/session id understood by the worker, if any.
    pub resume_id: Option<String>,
    /// Working directory reported to remote workers. Local workers are bound
    /// to their directory when created and ignore this.
    pub cwd: Option<PathBuf>,
    /// Append worker stdout to this file while it runs.
    pub stream_path: Option<PathBuf>,
}

impl ExecOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            resume_id: None,
            cwd: None,
            stream_path: None,
        }
    }
}

/// Raw completion of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the worker ended without an exit status (e.g. a signal).
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Turn a non-zero or abnormal completion into an [`AgentError::Exit`].
    pub fn check(self, worker: &str) -> Result<Self, AgentError> {
        if self.success() {
            return Ok(self);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        Err(AgentError::Exit {
            worker: worker.to_string(),
            code: self.exit_code,
            detail: truncate_detail(detail),
        })
    }
}

/// Failure of a worker invocation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{worker} timed out after {timeout:?}")]
    Timeout { worker: String, timeout: Duration },
    #[error("{worker} rejected credentials: {message}")]
    Auth { worker: String, message: String },
    #[error("failed to start {worker}: {message}")]
    Spawn { worker: String, message: String },
    #[error("{worker} exited with status {code:?}: {detail}")]
    Exit {
        worker: String,
        code: Option<i32>,
        detail: String,
    },
    #[error("{worker} returned HTTP {status}: {body}")]
    Http {
        worker: String,
        status: u16,
        body: String,
    },
    #[error("{worker} failed: {message}")]
    Failed { worker: String, message: String },
    #[error("{worker} is rate limited: {message}")]
    RateLimited { worker: String, message: String },
    #[error("{worker} returned unusable output: {message}")]
    Parse { worker: String, message: String },
    #[error("{worker} was released")]
    Released { worker: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AgentError::Timeout { .. } => ErrorKind::Timeout,
            AgentError::Auth { .. } => ErrorKind::Auth,
            AgentError::Spawn { .. } => ErrorKind::Spawn,
            AgentError::Exit { .. } | AgentError::Http { .. } | AgentError::Failed { .. } => {
                ErrorKind::Execution
            }
            AgentError::RateLimited { .. } => ErrorKind::RateLimit,
            AgentError::Parse { .. } => ErrorKind::Parse,
            AgentError::Released { .. } => ErrorKind::Released,
            AgentError::Other(_) => ErrorKind::Internal,
        }
    }

    fn worker(&self) -> Option<&str> {
        match self {
            AgentError::Timeout { worker, .. }
            | AgentError::Auth { worker, .. }
            | AgentError::Spawn { worker, .. }
            | AgentError::Exit { worker, .. }
            | AgentError::Http { worker, .. }
            | AgentError::Failed { worker, .. }
            | AgentError::RateLimited { worker, .. }
            | AgentError::Parse { worker, .. }
            | AgentError::Released { worker } => Some(worker),
            AgentError::Other(_) => None,
        }
    }

    /// Re-label execution failures according to `policy`.
    ///
    /// With `retry_on_rate_limit` set, an execution failure whose text looks
    /// like a rate limit becomes [`AgentError::RateLimited`]. With it unset,
    /// rate-limit errors are reported as plain execution failures.
    pub fn classify(self, policy: &RetryPolicy) -> Self {
        let worker = self.worker().unwrap_or("worker").to_string();
        match self.kind() {
            ErrorKind::Execution if policy.retry_on_rate_limit => {
                let message = self.to_string();
                if is_rate_limit_message(&message) {
                    AgentError::RateLimited { worker, message }
                } else {
                    self
                }
            }
            ErrorKind::RateLimit if !policy.retry_on_rate_limit => AgentError::Failed {
                worker,
                message: self.to_string(),
            },
            _ => self,
        }
    }

    /// Whether another attempt against the same handle may succeed.
    pub fn is_retryable(&self, policy: &RetryPolicy) -> bool {
        let kind = self.kind();
        kind != ErrorKind::Released && !policy.is_non_retryable(kind)
    }
}

/// Uniform capability interface over worker transports.
pub trait AgentHandle: Send + Sync {
    /// Resolved worker name, used in logs and errors.
    fn name(&self) -> &str;

    /// Run one invocation. A non-zero exit is reported in the output, not as an error.
    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError>;

    /// Run one invocation and parse stdout as JSON.
    fn execute_structured(&self, prompt: &str, options: &ExecOptions) -> Result<Value, AgentError> {
        let output = self.execute(prompt, options)?.check(self.name())?;
        parse_structured(self.name(), &output.stdout)
    }

    /// Run with a local retry budget; non-zero exits count as failures.
    fn execute_with_retry(
        &self,
        prompt: &str,
        options: &ExecOptions,
        policy: &RetryPolicy,
    ) -> Result<ExecOutput, AgentError> {
        retry_with(self.name(), policy, || {
            self.execute(prompt, options)?.check(self.name())
        })
    }

    /// Release underlying resources. Later invocations fail with `Released`.
    fn kill(&self) -> anyhow::Result<()>;

    fn is_alive(&self) -> bool;
}

/// Drive `attempt` until it succeeds, the budget runs out, or it fails with a
/// kind the policy refuses to retry.
pub(crate) fn retry_with<T>(
    worker: &str,
    policy: &RetryPolicy,
    mut attempt: impl FnMut() -> Result<T, AgentError>,
) -> Result<T, AgentError> {
    let max_attempts = policy.max_attempts();
    let mut n = 1;
    loop {
        let err = match attempt() {
            Ok(value) => {
                if n > 1 {
                    debug!(worker, attempt = n, "attempt succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => err.classify(policy),
        };
        if !err.is_retryable(policy) {
            warn!(worker, attempt = n, kind = err.kind().as_str(), err = %err, "not retrying");
            return Err(err);
        }
        if n >= max_attempts {
            warn!(worker, attempts = n, kind = err.kind().as_str(), err = %err, "retries exhausted");
            return Err(err);
        }
        let delay = policy.delay_for(n);
        warn!(
            worker,
            attempt = n,
            kind = err.kind().as_str(),
            delay_ms = delay.as_millis() as u64,
            err = %err,
            "attempt failed, retrying"
        );
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        n += 1;
    }
}

/// Parse worker stdout as JSON.
///
/// Workers that print progress before their result are accepted: when the
/// whole text is not JSON, the last line that is a JSON value wins. A CLI
/// result envelope (`{"type":"result","result":"..."}`) is unwrapped when its
/// `result` text holds JSON itself.
pub fn parse_structured(worker: &str, stdout: &str) -> Result<Value, AgentError> {
    let value = find_json(stdout).ok_or_else(|| AgentError::Parse {
        worker: worker.to_string(),
        message: format!("no JSON value in output ({} bytes)", stdout.len()),
    })?;
    Ok(unwrap_result_envelope(value))
}

fn find_json(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{') || line.starts_with('['))
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
}

fn unwrap_result_envelope(value: Value) -> Value {
    if value.get("type").and_then(Value::as_str) != Some("result") {
        return value;
    }
    match value.get("result").and_then(Value::as_str).and_then(find_json) {
        Some(inner) => inner,
        None => value,
    }
}

fn truncate_detail(detail: &str) -> String {
    const MAX: usize = 2_000;
    if detail.len() <= MAX {
        return detail.to_string();
    }
    let mut end = MAX;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &detail[..end])
}
