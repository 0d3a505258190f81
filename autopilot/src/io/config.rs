//! Autopilot configuration stored under `.autopilot/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::backoff::RetryPolicy;
use crate::core::pool_key::Transport;

/// Autopilot configuration (TOML).
///
/// Edited by humans. Missing fields default to values that run the built-in
/// stage list against a local `claude` CLI.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopilotConfig {
    /// Role (e.g. `planner`) to worker name.
    pub roles: BTreeMap<String, String>,
    /// Worker name to transport definition.
    pub workers: BTreeMap<String, WorkerConfig>,
    /// Role to resilience policy.
    pub policies: BTreeMap<String, RetryPolicy>,
    /// Role to fallback worker name.
    pub fallbacks: BTreeMap<String, String>,
    #[serde(rename = "loop")]
    pub loop_settings: LoopSettings,
    pub stages: Vec<StageConfig>,
    pub notify: NotifyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    pub transport: Transport,
    /// Argv for `process` and `tool_server` transports.
    pub command: Vec<String>,
    /// Base URL for the `http` transport.
    pub endpoint: Option<String>,
    /// Flag used to pass a resume id to `process` workers (e.g. `--resume`).
    pub resume_flag: Option<String>,
    /// Secret name holding a bearer token for `http` workers.
    pub api_key_secret: Option<String>,
    /// Tool name invoked on `tool_server` workers.
    pub tool: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            transport: Transport::Process,
            command: Vec::new(),
            endpoint: None,
            resume_flag: None,
            api_key_secret: None,
            tool: "execute".to_string(),
        }
    }
}

/// Which working directory a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Workspace,
    Repository,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopSettings {
    /// Upper bound on issues taken from one batch (after ordering).
    pub max_issues: usize,
    /// Run `git reset --hard && git clean -fd` after each issue.
    pub destructive_reset: bool,
    /// Whole-pipeline reruns for a non-rate-limit failure.
    pub max_pipeline_retries: u32,
    pub default_branch: String,
    pub branch_prefix: String,
    pub agent_timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            max_issues: 20,
            destructive_reset: false,
            max_pipeline_retries: 0,
            default_branch: "main".to_string(),
            branch_prefix: "autopilot/issue-".to_string(),
            agent_timeout_secs: 30 * 60,
            output_limit_bytes: 1_000_000,
        }
    }
}

/// One stage of the per-issue pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    pub name: String,
    pub role: String,
    #[serde(default = "default_scope")]
    pub scope: Scope,
    /// minijinja template rendered with `issue`, `branch`, `base_branch`, `input`.
    pub template: String,
}

fn default_scope() -> Scope {
    Scope::Repository
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        let mut workers = BTreeMap::new();
        workers.insert(
            "claude".to_string(),
            WorkerConfig {
                command: vec![
                    "claude".to_string(),
                    "-p".to_string(),
                    "--output-format".to_string(),
                    "json".to_string(),
                ],
                resume_flag: Some("--resume".to_string()),
                ..WorkerConfig::default()
            },
        );
        let stages = default_stages();
        let roles = stages
            .iter()
            .map(|stage| (stage.role.clone(), "claude".to_string()))
            .collect();
        Self {
            roles,
            workers,
            policies: BTreeMap::new(),
            fallbacks: BTreeMap::new(),
            loop_settings: LoopSettings::default(),
            stages,
            notify: NotifyConfig::default(),
        }
    }
}

fn default_stages() -> Vec<StageConfig> {
    let stage = |name: &str, role: &str, template: &str| StageConfig {
        name: name.to_string(),
        role: role.to_string(),
        scope: Scope::Repository,
        template: template.to_string(),
    };
    vec![
        stage(
            "draft",
            "drafter",
            "Draft a work item for issue {{ issue.id }}: {{ issue.title }}\n{{ issue.body or \"\" }}",
        ),
        stage("plan", "planner", "Plan the work item:\n{{ input | tojson }}"),
        stage("review", "reviewer", "Review this plan:\n{{ input | tojson }}"),
        stage(
            "implement",
            "programmer",
            "Implement the reviewed plan on branch {{ branch }}:\n{{ input | tojson }}",
        ),
        stage("quality", "reviewer", "Check the implementation on {{ branch }}:\n{{ input | tojson }}"),
        stage(
            "publish",
            "publisher",
            "Publish branch {{ branch }} against {{ base_branch }} and report pr_url:\n{{ input | tojson }}",
        ),
    ]
}

impl AutopilotConfig {
    pub fn validate(&self) -> Result<()> {
        for (name, worker) in &self.workers {
            match worker.transport {
                Transport::Process | Transport::ToolServer => {
                    if worker.command.is_empty() || worker.command[0].trim().is_empty() {
                        return Err(anyhow!("workers.{name}.command must be a non-empty array"));
                    }
                }
                Transport::Http => {
                    if worker.endpoint.as_deref().is_none_or(|e| e.trim().is_empty()) {
                        return Err(anyhow!("workers.{name}.endpoint is required for http"));
                    }
                }
            }
        }
        for (role, worker) in self.roles.iter().chain(self.fallbacks.iter()) {
            if !self.workers.contains_key(worker) {
                return Err(anyhow!("role '{role}' refers to unknown worker '{worker}'"));
            }
        }
        for stage in &self.stages {
            if !self.roles.contains_key(&stage.role) {
                return Err(anyhow!(
                    "stage '{}' uses role '{}' with no worker mapping",
                    stage.name,
                    stage.role
                ));
            }
        }
        if self.loop_settings.agent_timeout_secs == 0 {
            return Err(anyhow!("loop.agent_timeout_secs must be > 0"));
        }
        if self.loop_settings.output_limit_bytes == 0 {
            return Err(anyhow!("loop.output_limit_bytes must be > 0"));
        }
        if self.loop_settings.default_branch.trim().is_empty() {
            return Err(anyhow!("loop.default_branch must be non-empty"));
        }
        Ok(())
    }

    /// Worker name configured for `role`.
    pub fn worker_for_role(&self, role: &str) -> Result<&str> {
        self.roles
            .get(role)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("no worker configured for role '{role}'"))
    }

    pub fn worker(&self, name: &str) -> Result<&WorkerConfig> {
        self.workers
            .get(name)
            .ok_or_else(|| anyhow!("unknown worker '{name}'"))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AutopilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<AutopilotConfig> {
    if !path.exists() {
        let cfg = AutopilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AutopilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AutopilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AutopilotConfig::default());
        assert_eq!(cfg.stages.len(), 6);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = AutopilotConfig::default();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn parses_policies_fallbacks_and_http_workers() {
        let raw = r#"
stages = []

[roles]
programmer = "claude"

[fallbacks]
programmer = "api"

[workers.claude]
command = ["claude", "-p"]

[workers.api]
transport = "http"
endpoint = "http://127.0.0.1:9000"

[policies.programmer]
max_retries = 3
initial_backoff_ms = 0
retry_on_rate_limit = false

[loop]
max_issues = 4
destructive_reset = true
"#;
        let cfg: AutopilotConfig = toml::from_str(raw).expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.worker_for_role("programmer").expect("role"), "claude");
        assert_eq!(cfg.fallbacks["programmer"], "api");
        assert_eq!(cfg.workers["api"].transport, Transport::Http);
        let policy = &cfg.policies["programmer"];
        assert_eq!(policy.max_retries, 3);
        assert!(!policy.retry_on_rate_limit);
        assert_eq!(cfg.loop_settings.max_issues, 4);
        assert!(cfg.loop_settings.destructive_reset);
        assert_eq!(cfg.loop_settings.default_branch, "main");
    }

    #[test]
    fn rejects_roles_pointing_at_unknown_workers() {
        let mut cfg = AutopilotConfig::default();
        cfg.fallbacks
            .insert("programmer".to_string(), "ghost".to_string());
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("unknown worker 'ghost'"));
    }

    #[test]
    fn rejects_http_worker_without_endpoint() {
        let mut cfg = AutopilotConfig::default();
        cfg.workers.insert(
            "api".to_string(),
            WorkerConfig {
                transport: Transport::Http,
                ..WorkerConfig::default()
            },
        );
        assert!(cfg.validate().is_err());
    }
}
