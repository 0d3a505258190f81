//! Lazily built, context-keyed cache of worker handles for one batch run.
//!
//! Raw handles are cached undecorated; the retry/fallback decorator is applied
//! at request time so decorated and plain callers share one underlying worker.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use super::AgentHandle;
use super::http::HttpAgent;
use super::process::ProcessAgent;
use super::resilient::ResilientAgent;
use super::tool_server::ToolServerAgent;
use crate::core::backoff::RetryPolicy;
use crate::core::pool_key::{PoolKey, Transport};
use crate::io::config::{AutopilotConfig, Scope, WorkerConfig};

/// Secret name to value, resolved once per run.
pub type Secrets = BTreeMap<String, String>;

/// Builds raw handles for the pool.
pub trait AgentFactory: Send + Sync {
    fn create(
        &self,
        name: &str,
        worker: &WorkerConfig,
        transport: Transport,
        workdir: &Path,
    ) -> Result<Arc<dyn AgentHandle>>;
}

/// Builds handles from `[workers]` configuration.
pub struct ConfigAgentFactory {
    secrets: Secrets,
    output_limit_bytes: usize,
}

impl ConfigAgentFactory {
    pub fn new(secrets: Secrets, output_limit_bytes: usize) -> Self {
        Self {
            secrets,
            output_limit_bytes,
        }
    }
}

impl AgentFactory for ConfigAgentFactory {
    fn create(
        &self,
        name: &str,
        worker: &WorkerConfig,
        transport: Transport,
        workdir: &Path,
    ) -> Result<Arc<dyn AgentHandle>> {
        let handle: Arc<dyn AgentHandle> = match transport {
            Transport::Process => Arc::new(
                ProcessAgent::new(
                    name,
                    worker.command.clone(),
                    workdir,
                    self.output_limit_bytes,
                )
                .with_resume_flag(worker.resume_flag.clone()),
            ),
            Transport::Http => {
                let endpoint = worker
                    .endpoint
                    .clone()
                    .ok_or_else(|| anyhow!("worker '{name}' has no endpoint"))?;
                let api_key = match &worker.api_key_secret {
                    Some(secret) => Some(
                        self.secrets
                            .get(secret)
                            .cloned()
                            .ok_or_else(|| anyhow!("secret '{secret}' for worker '{name}' is not set"))?,
                    ),
                    None => None,
                };
                Arc::new(HttpAgent::new(name, endpoint, api_key))
            }
            Transport::ToolServer => Arc::new(ToolServerAgent::new(
                name,
                worker.command.clone(),
                workdir,
                worker.tool.clone(),
            )),
        };
        Ok(handle)
    }
}

/// Owner of every worker handle used during one batch run.
pub struct AgentPool {
    config: Arc<AutopilotConfig>,
    factory: Box<dyn AgentFactory>,
    workspace_root: PathBuf,
    active_root: RwLock<PathBuf>,
    handles: Mutex<BTreeMap<PoolKey, Arc<dyn AgentHandle>>>,
}

impl AgentPool {
    pub fn new(
        config: Arc<AutopilotConfig>,
        factory: Box<dyn AgentFactory>,
        workspace_root: impl Into<PathBuf>,
    ) -> Self {
        let workspace_root = workspace_root.into();
        Self {
            config,
            factory,
            active_root: RwLock::new(workspace_root.clone()),
            workspace_root,
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    /// Repository root that `Scope::Repository` handles are bound to.
    pub fn active_root(&self) -> PathBuf {
        match self.active_root.read() {
            Ok(root) => root.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn scope_dir(&self, scope: Scope) -> PathBuf {
        match scope {
            Scope::Workspace => self.workspace_root.clone(),
            Scope::Repository => self.active_root(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<PoolKey, Arc<dyn AgentHandle>>>> {
        self.handles
            .lock()
            .map_err(|_| anyhow!("agent pool lock poisoned"))
    }

    /// Handle for `role`, decorated with the role's policy and fallback if any.
    ///
    /// Returns the resolved worker name alongside the handle.
    #[instrument(skip_all, fields(role = %role, scope = ?scope))]
    pub fn get_handle(
        &self,
        role: &str,
        scope: Scope,
        transport: Option<Transport>,
    ) -> Result<(String, Arc<dyn AgentHandle>)> {
        let name = self.config.worker_for_role(role)?.to_string();
        let primary = self.raw_handle(&name, scope, transport)?;

        let policy = self.config.policies.get(role);
        let fallback_name = self.config.fallbacks.get(role);
        if policy.is_none() && fallback_name.is_none() {
            return Ok((name, primary));
        }
        let fallback = fallback_name
            .map(|fallback| self.raw_handle(fallback, scope, None))
            .transpose()
            .with_context(|| format!("fallback for role '{role}'"))?;
        let policy = policy.cloned().unwrap_or_else(RetryPolicy::none);
        debug!(worker = %name, has_fallback = fallback.is_some(), "decorating handle");
        Ok((name, Arc::new(ResilientAgent::new(primary, fallback, policy))))
    }

    fn raw_handle(
        &self,
        name: &str,
        scope: Scope,
        transport: Option<Transport>,
    ) -> Result<Arc<dyn AgentHandle>> {
        let worker = self.config.worker(name)?;
        let transport = transport.unwrap_or(worker.transport);
        let dir = self.scope_dir(scope);
        let key = match transport {
            Transport::Http => PoolKey::new(
                transport,
                name,
                worker.endpoint.clone().unwrap_or_default(),
            ),
            Transport::Process | Transport::ToolServer => PoolKey::for_dir(transport, name, &dir),
        };

        let mut handles = self.lock()?;
        if let Some(handle) = handles.get(&key) {
            return Ok(handle.clone());
        }
        let handle = self
            .factory
            .create(name, worker, transport, &dir)
            .with_context(|| format!("create worker '{name}'"))?;
        debug!(key = %key, "pooled new handle");
        handles.insert(key, handle.clone());
        Ok(handle)
    }

    /// Move `Scope::Repository` handles to `new_root`.
    ///
    /// Local-process handles bound to neither `new_root` nor the workspace
    /// root are evicted and released. Returns the number evicted.
    #[instrument(skip_all, fields(new_root = %new_root.display()))]
    pub fn update_context(&self, new_root: &Path) -> Result<usize> {
        match self.active_root.write() {
            Ok(mut root) => *root = new_root.to_path_buf(),
            Err(poisoned) => *poisoned.into_inner() = new_root.to_path_buf(),
        }
        let stale: Vec<(PoolKey, Arc<dyn AgentHandle>)> = {
            let mut handles = self.lock()?;
            let keys: Vec<PoolKey> = handles
                .keys()
                .filter(|key| {
                    key.transport.is_local_process()
                        && !key.is_bound_to(new_root)
                        && !key.is_bound_to(&self.workspace_root)
                })
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| handles.remove(&key).map(|handle| (key, handle)))
                .collect()
        };
        let evicted = stale.len();
        if evicted > 0 {
            info!(evicted, "releasing handles bound to a previous root");
        }
        release_all(stale);
        Ok(evicted)
    }

    /// Release every cached handle and clear the cache.
    pub fn shutdown(&self) {
        let all: Vec<(PoolKey, Arc<dyn AgentHandle>)> = match self.handles.lock() {
            Ok(mut handles) => std::mem::take(&mut *handles).into_iter().collect(),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner())
                .into_iter()
                .collect(),
        };
        debug!(handles = all.len(), "shutting down agent pool");
        release_all(all);
    }

    /// Keys currently cached, in order.
    pub fn cached_keys(&self) -> Vec<PoolKey> {
        match self.handles.lock() {
            Ok(handles) => handles.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        }
    }
}

impl Drop for AgentPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Kill handles concurrently; one failure never blocks the rest.
fn release_all(handles: Vec<(PoolKey, Arc<dyn AgentHandle>)>) {
    thread::scope(|scope| {
        let joins: Vec<_> = handles
            .iter()
            .map(|(key, handle)| (key, scope.spawn(move || handle.kill())))
            .collect();
        for (key, join) in joins {
            let outcome = match join.join() {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow!("kill panicked")),
            };
            if let Err(err) = outcome {
                warn!(key = %key, err = %format!("{err:#}"), "failed to release handle");
            }
        }
    });
}
