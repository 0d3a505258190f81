//! Dependency-aware batch driver for external coding agents.
//!
//! Reads a batch of issues, orders them by dependency and difficulty, and
//! drives each through the configured agent stages. Progress is persisted in
//! `.autopilot/state/loop_state.json` so a batch can be inspected or resumed.

use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use autopilot::agent::pool::{AgentPool, ConfigAgentFactory, Secrets};
use autopilot::exit_codes;
use autopilot::io::config::{AutopilotConfig, load_config};
use autopilot::io::control::ControlFiles;
use autopilot::io::event_log::EventLog;
use autopilot::io::git::Git;
use autopilot::io::init::{AutopilotPaths, InitOptions, init_autopilot};
use autopilot::io::issues::{IssueSource, JsonIssueFile};
use autopilot::io::loop_state::load_loop_state_if_exists;
use autopilot::io::notify::{Notifiers, TracingNotifier, WebhookNotifier};
use autopilot::logging;
use autopilot::pipeline::context::{CancelToken, RunContext};
use autopilot::pipeline::prompt_stage::StagedPipeline;
use autopilot::scheduler::workspace::GitWorkTree;
use autopilot::scheduler::{LoopOptions, LoopSummary, prepare_loop};
use clap::{Parser, Subcommand};
use tracing::{debug, warn};

#[derive(Parser)]
#[command(
    name = "autopilot",
    version,
    about = "Dependency-aware batch driver for coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.autopilot/` with a default config.
    Init {
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
    /// Work through a batch of issues.
    Run {
        /// JSON file with an array of issues (or `{ "issues": [...] }`).
        #[arg(long)]
        issues: PathBuf,
        /// Keep issues completed by the previous run.
        #[arg(long)]
        resume: bool,
    },
    /// Print the persisted loop state.
    Status,
    /// Ask a running batch to stop after the current stage.
    Stop,
    /// Pause a running batch at the next stage boundary.
    Pause,
    /// Let a paused batch continue.
    Unpause,
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = env::current_dir().context("resolve current directory")?;
    let paths = AutopilotPaths::new(&root);
    match cli.command {
        Command::Init { force } => {
            let paths = init_autopilot(&root, &InitOptions { force })?;
            println!("initialized {}", paths.autopilot_dir.display());
            Ok(exit_codes::OK)
        }
        Command::Run { issues, resume } => cmd_run(&paths, &issues, resume),
        Command::Status => cmd_status(&paths),
        Command::Stop => {
            ControlFiles::new(&paths.state_dir).request_stop()?;
            Ok(exit_codes::OK)
        }
        Command::Pause => {
            ControlFiles::new(&paths.state_dir).set_paused(true)?;
            Ok(exit_codes::OK)
        }
        Command::Unpause => {
            ControlFiles::new(&paths.state_dir).set_paused(false)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_run(paths: &AutopilotPaths, issues_path: &Path, resume: bool) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let issues = JsonIssueFile::new(issues_path).list_issues()?;
    let control = ControlFiles::new(&paths.state_dir);
    control.clear_stop()?;

    let prepared = prepare_loop(
        &issues,
        &paths.loop_state_path,
        &LoopOptions {
            resume,
            max_issues: config.loop_settings.max_issues,
        },
    )?;
    let run_id = prepared.run_id();
    let events = EventLog::open(&paths.run_dir(run_id).join("events.jsonl"))?;
    debug!(run_id, events = ?events.path(), "run claimed");

    let secrets = resolve_secrets(&config);
    let config = Arc::new(config);
    let factory = ConfigAgentFactory::new(secrets.clone(), config.loop_settings.output_limit_bytes);
    let pool = AgentPool::new(config.clone(), Box::new(factory), &paths.root);
    let cancel = Arc::new(CancelToken::new());
    let ctx = RunContext::new(paths, config.clone(), pool, events)
        .with_cancel(cancel.clone())
        .with_secrets(secrets);

    let pipeline = StagedPipeline::new(config.stages.clone());
    let work_tree = GitWorkTree::new(
        Git::new(&paths.root),
        config.loop_settings.default_branch.clone(),
        config.loop_settings.destructive_reset,
    );
    let mut notifiers = Notifiers::new().with(TracingNotifier);
    if let Some(url) = &config.notify.webhook_url {
        notifiers = notifiers.with(WebhookNotifier::new(url.clone()));
    }

    let watcher = control.watch(cancel);
    let summary = prepared.run(&ctx, &pipeline, &work_tree, &notifiers);
    watcher.stop();
    ctx.pool.shutdown();

    print_summary(&summary);
    Ok(summary.exit_code())
}

/// Read every secret a worker names from the environment.
fn resolve_secrets(config: &AutopilotConfig) -> Secrets {
    let mut secrets = Secrets::new();
    for (name, worker) in &config.workers {
        let Some(secret) = &worker.api_key_secret else {
            continue;
        };
        match env::var(secret) {
            Ok(value) => {
                secrets.insert(secret.clone(), value);
            }
            Err(_) => warn!(worker = %name, secret = %secret, "secret not set in environment"),
        }
    }
    secrets
}

fn print_summary(summary: &LoopSummary) {
    for note in &summary.diagnostics {
        println!("note: {note}");
    }
    let counts = &summary.counts;
    println!(
        "run {}: {} completed, {} failed, {} skipped, {} deferred{}",
        summary.run_id,
        counts.completed,
        counts.failed,
        counts.skipped,
        counts.deferred,
        if summary.cancelled { " (cancelled)" } else { "" }
    );
    if let Some(path) = &summary.report_path {
        println!("integration report: {}", path.display());
    }
}

fn cmd_status(paths: &AutopilotPaths) -> Result<i32> {
    let Some(state) = load_loop_state_if_exists(&paths.loop_state_path)? else {
        println!("no loop state at {}", paths.loop_state_path.display());
        return Ok(exit_codes::OK);
    };
    println!(
        "run {} ({:?}) started {} heartbeat {}",
        state.run_id,
        state.status,
        state.started_at.to_rfc3339(),
        state.heartbeat.to_rfc3339()
    );
    for (index, entry) in state.entries.iter().enumerate() {
        let marker = if state.current_index == Some(index) { '>' } else { ' ' };
        println!(
            "{marker} {:<12} {:<12} {:<32} {}",
            entry.issue.id,
            entry.status.as_str(),
            entry.branch.as_deref().unwrap_or("-"),
            entry.error.as_deref().or(entry.pr.as_deref()).unwrap_or("")
        );
    }
    Ok(exit_codes::OK)
}
