//! Retry/fallback decorator over any [`AgentHandle`].

use std::sync::Arc;
use std::thread;

use serde_json::Value;
use tracing::{info, warn};

use super::{AgentError, AgentHandle, ExecOptions, ExecOutput, retry_with};
use crate::core::backoff::RetryPolicy;

/// Retries a primary handle with backoff, then gives an optional fallback a
/// single attempt whose result is returned as-is.
///
/// Never races primary and fallback; the sequence is strictly ordered.
pub struct ResilientAgent {
    name: String,
    primary: Arc<dyn AgentHandle>,
    fallback: Option<Arc<dyn AgentHandle>>,
    policy: RetryPolicy,
}

impl ResilientAgent {
    pub fn new(
        primary: Arc<dyn AgentHandle>,
        fallback: Option<Arc<dyn AgentHandle>>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            name: primary.name().to_string(),
            primary,
            fallback,
            policy,
        }
    }

    fn run<T>(
        &self,
        policy: &RetryPolicy,
        primary: impl FnMut() -> Result<T, AgentError>,
        fallback: impl FnOnce(&dyn AgentHandle) -> Result<T, AgentError>,
    ) -> Result<T, AgentError> {
        let err = match retry_with(&self.name, policy, primary) {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let Some(backup) = &self.fallback else {
            return Err(err);
        };
        info!(
            worker = %self.name,
            fallback = backup.name(),
            kind = err.kind().as_str(),
            "primary exhausted, trying fallback"
        );
        fallback(backup.as_ref())
    }
}

impl AgentHandle for ResilientAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError> {
        self.run(
            &self.policy,
            || self.primary.execute(prompt, options)?.check(&self.name),
            |backup| backup.execute(prompt, options),
        )
    }

    fn execute_structured(&self, prompt: &str, options: &ExecOptions) -> Result<Value, AgentError> {
        self.run(
            &self.policy,
            || self.primary.execute_structured(prompt, options),
            |backup| backup.execute_structured(prompt, options),
        )
    }

    /// Same sequence as `execute`, with `policy` in place of the configured one.
    fn execute_with_retry(
        &self,
        prompt: &str,
        options: &ExecOptions,
        policy: &RetryPolicy,
    ) -> Result<ExecOutput, AgentError> {
        self.run(
            policy,
            || self.primary.execute(prompt, options)?.check(&self.name),
            |backup| backup.execute(prompt, options),
        )
    }

    /// Release primary and fallback concurrently; one failure does not stop the other.
    fn kill(&self) -> anyhow::Result<()> {
        let results = thread::scope(|scope| {
            let primary = scope.spawn(|| self.primary.kill());
            let fallback = self
                .fallback
                .as_ref()
                .map(|backup| scope.spawn(move || backup.kill()));
            let mut results = vec![primary.join()];
            results.extend(fallback.map(|handle| handle.join()));
            results
        });
        let mut first_error = None;
        for result in results {
            let err = match result {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => err,
                Err(_) => anyhow::anyhow!("kill panicked"),
            };
            warn!(worker = %self.name, err = %format!("{err:#}"), "failed to release handle");
            first_error.get_or_insert(err);
        }
        first_error.map_or(Ok(()), Err)
    }

    fn is_alive(&self) -> bool {
        self.primary.is_alive()
    }
}
