//! Test-only helpers: scripted workers, pipelines and work trees, plus
//! temporary git repositories and run contexts.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result, anyhow};
use tempfile::TempDir;

use crate::agent::pool::{AgentFactory, AgentPool};
use crate::agent::{AgentError, AgentHandle, ExecOptions, ExecOutput};
use crate::core::backoff::RetryPolicy;
use crate::core::pool_key::Transport;
use crate::core::types::Issue;
use crate::io::config::{AutopilotConfig, WorkerConfig};
use crate::io::event_log::EventLog;
use crate::io::init::AutopilotPaths;
use crate::io::notify::{LoopEvent, Notifier};
use crate::pipeline::context::RunContext;
use crate::pipeline::runner::PipelineRun;
use crate::pipeline::{IssuePipeline, IssueRequest};
use crate::scheduler::workspace::WorkTree;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Build an issue with a deterministic title and the given dependencies.
pub fn issue(id: &str, depends_on: &[&str]) -> Issue {
    Issue {
        id: id.to_string(),
        title: format!("{id} title"),
        difficulty: 0,
        depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
        body: None,
    }
}

/// Same as [`issue`] with an explicit difficulty.
pub fn issue_with_difficulty(id: &str, difficulty: u32) -> Issue {
    Issue {
        difficulty,
        ..issue(id, &[])
    }
}

pub fn exit_output(code: i32, stdout: &str, stderr: &str) -> ExecOutput {
    ExecOutput {
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
    }
}

#[derive(Default)]
struct ScriptedState {
    responses: Mutex<VecDeque<Result<ExecOutput, AgentError>>>,
    prompts: Mutex<Vec<String>>,
    options: Mutex<Vec<ExecOptions>>,
    calls: AtomicUsize,
    killed: AtomicBool,
}

/// Worker handle that replays queued responses. Clones share one script.
///
/// An exhausted script answers with a `Failed` error.
#[derive(Clone)]
pub struct ScriptedAgent {
    name: String,
    state: Arc<ScriptedState>,
}

impl ScriptedAgent {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(ScriptedState::default()),
        }
    }

    /// Queue a successful invocation with `stdout`.
    pub fn respond_ok(self, stdout: &str) -> Self {
        self.respond(Ok(exit_output(0, stdout, "")))
    }

    /// Queue an invocation that exits with `code`.
    pub fn respond_exit(self, code: i32, stderr: &str) -> Self {
        self.respond(Ok(exit_output(code, "", stderr)))
    }

    pub fn respond_err(self, err: AgentError) -> Self {
        self.respond(Err(err))
    }

    pub fn respond(self, response: Result<ExecOutput, AgentError>) -> Self {
        lock(&self.state.responses).push_back(response);
        self
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.state.prompts).clone()
    }

    /// Working directories passed with each invocation.
    pub fn cwds(&self) -> Vec<Option<PathBuf>> {
        lock(&self.state.options)
            .iter()
            .map(|options| options.cwd.clone())
            .collect()
    }

    /// Stream files requested with each invocation.
    pub fn stream_paths(&self) -> Vec<Option<PathBuf>> {
        lock(&self.state.options)
            .iter()
            .map(|options| options.stream_path.clone())
            .collect()
    }

    pub fn killed(&self) -> bool {
        self.state.killed.load(Ordering::SeqCst)
    }
}

impl AgentHandle for ScriptedAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, prompt: &str, options: &ExecOptions) -> Result<ExecOutput, AgentError> {
        if self.killed() {
            return Err(AgentError::Released {
                worker: self.name.clone(),
            });
        }
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.state.prompts).push(prompt.to_string());
        lock(&self.state.options).push(options.clone());
        lock(&self.state.responses)
            .pop_front()
            .unwrap_or_else(|| {
                Err(AgentError::Failed {
                    worker: self.name.clone(),
                    message: "script exhausted".to_string(),
                })
            })
    }

    fn kill(&self) -> Result<()> {
        self.state.killed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_alive(&self) -> bool {
        !self.killed()
    }
}

/// Factory that hands out pre-built scripted agents by worker name.
///
/// Every `create` call gets a fresh handle sharing the named agent's script,
/// so tests can observe how many handles the pool built and where.
#[derive(Default)]
pub struct ScriptedFactory {
    agents: BTreeMap<String, ScriptedAgent>,
    created: Arc<Mutex<Vec<(String, Transport, PathBuf)>>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, agent: &ScriptedAgent) -> Self {
        self.agents.insert(agent.name.clone(), agent.clone());
        self
    }

    /// Shared log of `(worker, transport, workdir)` per created handle.
    pub fn created(&self) -> Arc<Mutex<Vec<(String, Transport, PathBuf)>>> {
        self.created.clone()
    }
}

impl AgentFactory for ScriptedFactory {
    fn create(
        &self,
        name: &str,
        _worker: &WorkerConfig,
        transport: Transport,
        workdir: &Path,
    ) -> Result<Arc<dyn AgentHandle>> {
        let agent = self
            .agents
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("no scripted agent named '{name}'"))?;
        lock(&self.created).push((name.to_string(), transport, workdir.to_path_buf()));
        Ok(Arc::new(agent))
    }
}

/// Builds a `RunContext` over a temp workspace with scripted workers.
pub struct ContextBuilder {
    config: AutopilotConfig,
    factory: ScriptedFactory,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextBuilder {
    /// Default loop settings, no roles, no stages.
    pub fn new() -> Self {
        let config = AutopilotConfig {
            roles: BTreeMap::new(),
            workers: BTreeMap::new(),
            stages: Vec::new(),
            ..AutopilotConfig::default()
        };
        Self {
            config,
            factory: ScriptedFactory::new(),
        }
    }

    fn register(&mut self, agent: &ScriptedAgent) {
        self.config.workers.insert(
            agent.name.clone(),
            WorkerConfig {
                command: vec!["scripted".to_string()],
                ..WorkerConfig::default()
            },
        );
        self.factory = std::mem::take(&mut self.factory).with(agent);
    }

    pub fn role(mut self, role: &str, agent: &ScriptedAgent) -> Self {
        self.register(agent);
        self.config
            .roles
            .insert(role.to_string(), agent.name.clone());
        self
    }

    pub fn fallback(mut self, role: &str, agent: &ScriptedAgent) -> Self {
        self.register(agent);
        self.config
            .fallbacks
            .insert(role.to_string(), agent.name.clone());
        self
    }

    pub fn policy(mut self, role: &str, policy: RetryPolicy) -> Self {
        self.config.policies.insert(role.to_string(), policy);
        self
    }

    pub fn configure(mut self, edit: impl FnOnce(&mut AutopilotConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn build(self) -> Result<(TempDir, RunContext)> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        let paths = AutopilotPaths::new(temp.path());
        let config = Arc::new(self.config);
        let pool = AgentPool::new(config.clone(), Box::new(self.factory), temp.path());
        let ctx = RunContext::new(&paths, config, pool, EventLog::disabled());
        Ok((temp, ctx))
    }
}

/// Context with no roles configured.
pub fn test_context() -> (TempDir, RunContext) {
    ContextBuilder::new().build().expect("test context")
}

/// Context mapping each role to its scripted agent.
pub fn scripted_context(roles: &[(&str, ScriptedAgent)]) -> (TempDir, RunContext) {
    roles
        .iter()
        .fold(ContextBuilder::new(), |builder, (role, agent)| {
            builder.role(role, agent)
        })
        .build()
        .expect("scripted context")
}

/// One recorded `run_issue` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineCall {
    pub issue_id: String,
    pub branch: String,
    pub base_branch: String,
    pub attempt: u32,
}

/// Pipeline replaying queued runs per issue; unscripted calls complete.
#[derive(Default)]
pub struct ScriptedPipeline {
    scripts: Mutex<HashMap<String, VecDeque<PipelineRun>>>,
    calls: Mutex<Vec<PipelineCall>>,
}

impl ScriptedPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, issue_id: &str, runs: Vec<PipelineRun>) -> Self {
        lock(&self.scripts)
            .entry(issue_id.to_string())
            .or_default()
            .extend(runs);
        self
    }

    pub fn calls(&self) -> Vec<PipelineCall> {
        lock(&self.calls).clone()
    }

    /// Issue ids in call order.
    pub fn started(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .map(|call| call.issue_id.clone())
            .collect()
    }
}

impl IssuePipeline for ScriptedPipeline {
    fn run_issue(&self, request: &IssueRequest<'_>, _ctx: &RunContext) -> PipelineRun {
        lock(&self.calls).push(PipelineCall {
            issue_id: request.issue.id.clone(),
            branch: request.branch.to_string(),
            base_branch: request.base_branch.to_string(),
            attempt: request.attempt,
        });
        lock(&self.scripts)
            .get_mut(&request.issue.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| PipelineRun::completed(Vec::new()))
    }
}

#[derive(Default)]
struct WorkTreeState {
    prepared: Vec<(String, String)>,
    finished: Vec<(String, String)>,
    pruned: Vec<String>,
    commits: HashMap<String, usize>,
    changes: HashMap<String, Vec<String>>,
    existing: BTreeSet<String>,
}

/// In-memory work tree recording every transition.
#[derive(Default)]
pub struct ScriptedWorkTree {
    state: Mutex<WorkTreeState>,
}

impl ScriptedWorkTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `branch` as existing with `count` commits beyond the default branch.
    pub fn with_commits(self, branch: &str, count: usize) -> Self {
        {
            let mut state = lock(&self.state);
            state.commits.insert(branch.to_string(), count);
            state.existing.insert(branch.to_string());
        }
        self
    }

    pub fn with_changes(self, branch: &str, files: &[&str]) -> Self {
        {
            let mut state = lock(&self.state);
            state.changes.insert(
                branch.to_string(),
                files.iter().map(|file| file.to_string()).collect(),
            );
            state.existing.insert(branch.to_string());
        }
        self
    }

    /// `(branch, base)` per prepared branch.
    pub fn prepared(&self) -> Vec<(String, String)> {
        lock(&self.state).prepared.clone()
    }

    /// `(branch, commit message)` per finished issue.
    pub fn finished(&self) -> Vec<(String, String)> {
        lock(&self.state).finished.clone()
    }

    pub fn pruned(&self) -> Vec<String> {
        lock(&self.state).pruned.clone()
    }
}

impl WorkTree for ScriptedWorkTree {
    fn prepare_branch(&self, branch: &str, base: &str) -> Result<()> {
        let mut state = lock(&self.state);
        state.prepared.push((branch.to_string(), base.to_string()));
        state.existing.insert(branch.to_string());
        Ok(())
    }

    fn finish_issue(&self, branch: &str, commit_message: &str) -> Result<bool> {
        lock(&self.state)
            .finished
            .push((branch.to_string(), commit_message.to_string()));
        Ok(false)
    }

    fn prune_empty_branch(&self, branch: &str) -> Result<bool> {
        let mut state = lock(&self.state);
        if !state.existing.contains(branch) {
            return Ok(false);
        }
        if state.commits.get(branch).copied().unwrap_or(0) > 0 {
            return Ok(false);
        }
        state.existing.remove(branch);
        state.pruned.push(branch.to_string());
        Ok(true)
    }

    fn changed_files(&self, branch: &str) -> Result<Vec<String>> {
        Ok(lock(&self.state)
            .changes
            .get(branch)
            .cloned()
            .unwrap_or_default())
    }
}

/// Notifier that keeps every event it receives.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<LoopEvent>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        lock(&self.events).clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        lock(&self.events).iter().map(LoopEvent::name).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &LoopEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

/// Temporary git repository with one commit on its initial branch.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp repo")?;
        let repo = Self { temp };
        repo.git(&["init"])?;
        repo.git(&["config", "user.email", "test@example.com"])?;
        repo.git(&["config", "user.name", "test"])?;
        std::fs::write(repo.path().join("README.md"), "hi\n").context("write README")?;
        repo.git(&["add", "README.md"])?;
        repo.git(&["commit", "-m", "chore: init"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.path())
            .status()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.success() {
            return Err(anyhow!("git {} failed", args.join(" ")));
        }
        Ok(())
    }
}
