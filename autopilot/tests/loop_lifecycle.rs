//! Loop-level scenarios driven through scripted pipelines and work trees.

use autopilot::core::backoff::RetryPolicy;
use autopilot::core::classifier::ErrorKind;
use autopilot::core::dependency::{ALL_DEPENDENCIES_FAILED, DEPENDENCY_CYCLE};
use autopilot::core::pool_key::{PoolKey, Transport};
use autopilot::core::types::{Issue, LoopStatus, QueueStatus};
use autopilot::exit_codes;
use autopilot::io::config::{Scope, StageConfig};
use autopilot::io::init::AutopilotPaths;
use autopilot::io::loop_state::load_loop_state;
use autopilot::io::notify::LoopEvent;
use autopilot::pipeline::context::RunContext;
use autopilot::pipeline::prompt_stage::StagedPipeline;
use autopilot::pipeline::runner::PipelineRun;
use autopilot::pipeline::{IssuePipeline, IssueRequest};
use autopilot::scheduler::{LoopOptions, run_loop};
use autopilot::test_support::{
    ContextBuilder, RecordingNotifier, ScriptedAgent, ScriptedPipeline, ScriptedWorkTree, issue,
    test_context,
};

fn state_path(ctx: &RunContext) -> std::path::PathBuf {
    AutopilotPaths::new(&ctx.workspace_root).loop_state_path
}

fn failed(message: &str) -> PipelineRun {
    PipelineRun::failed(message, Some(ErrorKind::Execution))
}

fn rate_limited() -> PipelineRun {
    PipelineRun::failed("stage 'plan': w is rate limited: 429", Some(ErrorKind::RateLimit))
}

/// A has no dependency, B depends on A, C depends on an id outside the batch.
/// A fails: B is skipped without ever starting, C runs normally.
#[test]
fn failed_dependency_cascades_to_skip_and_unknown_dependency_never_blocks() {
    let (_temp, ctx) = test_context();
    let issues = vec![issue("A", &[]), issue("B", &["A"]), issue("C", &["external-9"])];
    let pipeline = ScriptedPipeline::new().on("A", vec![failed("stage 'implement': boom")]);
    let tree = ScriptedWorkTree::new();
    let notifier = RecordingNotifier::new();

    let summary = run_loop(
        &issues,
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &tree,
        &notifier,
    )
    .expect("loop");

    assert_eq!(pipeline.started(), vec!["A".to_string(), "C".to_string()]);
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.skipped, 1);
    assert_eq!(summary.counts.completed, 1);
    assert_eq!(summary.exit_code(), exit_codes::FAILURES);

    let state = load_loop_state(&state_path(&ctx)).expect("state");
    assert_eq!(state.status, LoopStatus::Completed);
    let ids: Vec<&str> = state.entries.iter().map(|e| e.issue.id.as_str()).collect();
    let pos = |id: &str| ids.iter().position(|x| *x == id).expect("present");
    assert!(pos("A") < pos("B"));

    let b = &state.entries[pos("B")];
    assert_eq!(b.status, QueueStatus::Skipped);
    assert_eq!(b.error.as_deref(), Some(ALL_DEPENDENCIES_FAILED));
    assert_eq!(b.passes, 0);
    assert!(b.started_at.is_none());
    assert!(!notifier.events().iter().any(|event| matches!(
        event,
        LoopEvent::IssueStart { issue_id, .. } if issue_id == "B"
    )));
    assert_eq!(state.entries[pos("C")].status, QueueStatus::Completed);
}

/// A is rate limited on the first pass, which leaves B waiting. The retry
/// pass reprocesses both exactly once and B builds on A's branch.
#[test]
fn unresolved_dependency_defers_and_is_reprocessed_once() {
    let (_temp, ctx) = test_context();
    let issues = vec![issue("A", &[]), issue("B", &["A"])];
    let pipeline = ScriptedPipeline::new().on("A", vec![rate_limited()]);
    let tree = ScriptedWorkTree::new();
    let notifier = RecordingNotifier::new();

    let summary = run_loop(
        &issues,
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &tree,
        &notifier,
    )
    .expect("loop");

    assert_eq!(summary.counts.completed, 2);
    assert_eq!(summary.exit_code(), exit_codes::OK);
    assert_eq!(
        pipeline.started(),
        vec!["A".to_string(), "A".to_string(), "B".to_string()]
    );
    let b_call = &pipeline.calls()[2];
    assert_eq!(b_call.base_branch, "autopilot/issue-A");

    let deferred: Vec<String> = notifier
        .events()
        .into_iter()
        .filter_map(|event| match event {
            LoopEvent::IssueDeferred { issue_id, .. } => Some(issue_id),
            _ => None,
        })
        .collect();
    assert_eq!(deferred, vec!["A".to_string(), "B".to_string()]);

    let state = load_loop_state(&state_path(&ctx)).expect("state");
    assert_eq!(state.entries[0].passes, 2);
    assert_eq!(state.entries[1].passes, 1);
    assert!(notifier.events().contains(&LoopEvent::IssueStart {
        issue_id: "B".to_string(),
        retry_pass: true,
    }));
}

#[test]
fn rate_limit_on_the_retry_pass_is_a_failure() {
    let (_temp, ctx) = test_context();
    let pipeline = ScriptedPipeline::new().on("A", vec![rate_limited(), rate_limited()]);
    let summary = run_loop(
        &[issue("A", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("loop");
    assert_eq!(summary.counts.failed, 1);
    assert_eq!(summary.counts.deferred, 0);
    assert_eq!(pipeline.started().len(), 2);
}

#[test]
fn mutual_dependencies_end_skipped_without_running() {
    let (_temp, ctx) = test_context();
    let pipeline = ScriptedPipeline::new();
    let summary = run_loop(
        &[issue("A", &["B"]), issue("B", &["A"])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("loop");
    assert!(pipeline.started().is_empty());
    assert_eq!(summary.counts.skipped, 2);
    assert!(!summary.diagnostics.is_empty());
    let state = load_loop_state(&state_path(&ctx)).expect("state");
    for entry in &state.entries {
        assert_eq!(entry.error.as_deref(), Some(DEPENDENCY_CYCLE));
    }
}

/// With several completed dependencies the base branch follows the declared
/// order, not the alphabetical one.
#[test]
fn base_branch_follows_declared_dependency_order() {
    let (_temp, ctx) = test_context();
    let issues: Vec<Issue> = serde_json::from_str(
        r#"[
            {"id": "alpha", "title": "alpha"},
            {"id": "zeta", "title": "zeta"},
            {"id": "C", "title": "c", "depends_on": ["zeta", "alpha"]}
        ]"#,
    )
    .expect("issues");
    let pipeline = ScriptedPipeline::new();

    let summary = run_loop(
        &issues,
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("loop");

    assert_eq!(summary.counts.completed, 3);
    let c_call = pipeline
        .calls()
        .into_iter()
        .find(|call| call.issue_id == "C")
        .expect("C ran");
    assert_eq!(c_call.base_branch, "autopilot/issue-zeta");
}

/// One stage whose worker exits 1, 1, then 0 under `max_retries = 3`.
#[test]
fn worker_retries_inside_the_pipeline_complete_the_issue() {
    let worker = ScriptedAgent::new("claude")
        .respond_exit(1, "transient")
        .respond_exit(1, "transient")
        .respond_ok(r#"{"pr_url":"https://example.test/pr/7"}"#);
    let (_temp, ctx) = ContextBuilder::new()
        .role("programmer", &worker)
        .policy(
            "programmer",
            RetryPolicy {
                max_retries: 3,
                initial_backoff_ms: 0,
                ..RetryPolicy::default()
            },
        )
        .build()
        .expect("context");
    let pipeline = StagedPipeline::new(vec![StageConfig {
        name: "implement".to_string(),
        role: "programmer".to_string(),
        scope: Scope::Repository,
        template: "Implement {{ issue.title }} on {{ branch }}".to_string(),
    }]);
    let tree = ScriptedWorkTree::new();
    let notifier = RecordingNotifier::new();

    let summary = run_loop(
        &[issue("7", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &tree,
        &notifier,
    )
    .expect("loop");

    assert_eq!(summary.counts.completed, 1);
    assert_eq!(worker.calls(), 3);
    assert_eq!(worker.prompts()[0], "Implement 7 title on autopilot/issue-7");
    let state = load_loop_state(&state_path(&ctx)).expect("state");
    assert_eq!(state.entries[0].pr.as_deref(), Some("https://example.test/pr/7"));
    assert_eq!(
        notifier.names(),
        vec!["loop_start", "issue_start", "issue_complete", "loop_complete"]
    );
    assert_eq!(
        tree.prepared(),
        vec![("autopilot/issue-7".to_string(), "main".to_string())]
    );
    assert_eq!(tree.finished().len(), 1);
}

#[test]
fn pipeline_reruns_within_the_configured_budget() {
    let (_temp, ctx) = ContextBuilder::new()
        .configure(|config| config.loop_settings.max_pipeline_retries = 2)
        .build()
        .expect("context");
    let pipeline = ScriptedPipeline::new().on("A", vec![failed("one"), failed("two")]);
    let summary = run_loop(
        &[issue("A", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("loop");
    assert_eq!(summary.counts.completed, 1);
    let attempts: Vec<u32> = pipeline.calls().iter().map(|call| call.attempt).collect();
    assert_eq!(attempts, vec![1, 2, 3]);
}

#[test]
fn failed_branches_without_commits_are_pruned() {
    let (_temp, ctx) = test_context();
    let pipeline = ScriptedPipeline::new()
        .on("A", vec![failed("nothing done")])
        .on("B", vec![failed("half done")]);
    let tree = ScriptedWorkTree::new().with_commits("autopilot/issue-B", 1);
    run_loop(
        &[issue("A", &[]), issue("B", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &pipeline,
        &tree,
        &RecordingNotifier::new(),
    )
    .expect("loop");

    assert_eq!(tree.pruned(), vec!["autopilot/issue-A".to_string()]);
    let state = load_loop_state(&state_path(&ctx)).expect("state");
    assert_eq!(state.entries[0].branch, None);
    assert_eq!(state.entries[1].branch.as_deref(), Some("autopilot/issue-B"));
}

#[test]
fn two_completions_produce_an_integration_report() {
    let (_temp, ctx) = test_context();
    let tree = ScriptedWorkTree::new()
        .with_changes("autopilot/issue-A", &["src/lib.rs"])
        .with_changes("autopilot/issue-B", &["src/lib.rs", "src/main.rs"]);
    let summary = run_loop(
        &[issue("A", &[]), issue("B", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &ScriptedPipeline::new(),
        &tree,
        &RecordingNotifier::new(),
    )
    .expect("loop");
    let report = summary.report_path.expect("report written");
    let contents = std::fs::read_to_string(report).expect("read report");
    assert!(contents.contains("src/lib.rs"));
}

struct CancellingPipeline;

impl IssuePipeline for CancellingPipeline {
    fn run_issue(&self, _request: &IssueRequest<'_>, ctx: &RunContext) -> PipelineRun {
        ctx.cancel.cancel();
        PipelineRun::cancelled(Vec::new())
    }
}

#[test]
fn cancellation_defers_the_current_issue_and_starts_nothing_else() {
    let (_temp, ctx) = test_context();
    let notifier = RecordingNotifier::new();
    let summary = run_loop(
        &[issue("A", &[]), issue("B", &[])],
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &CancellingPipeline,
        &ScriptedWorkTree::new(),
        &notifier,
    )
    .expect("loop");

    assert!(summary.cancelled);
    assert_eq!(summary.exit_code(), exit_codes::CANCELLED);
    let state = load_loop_state(&state_path(&ctx)).expect("state");
    assert_eq!(state.status, LoopStatus::Cancelled);
    assert_eq!(state.entries[0].status, QueueStatus::Deferred);
    assert_eq!(state.entries[0].error.as_deref(), Some("cancelled"));
    assert_eq!(state.entries[1].status, QueueStatus::Pending);
    assert_eq!(
        notifier.names().iter().filter(|name| **name == "issue_start").count(),
        1
    );
}

#[test]
fn resume_skips_issues_completed_by_the_previous_run() {
    let (_temp, ctx) = test_context();
    let issues = vec![issue("A", &[]), issue("B", &["A"])];
    let first = ScriptedPipeline::new().on("B", vec![failed("broke")]);
    run_loop(
        &issues,
        &state_path(&ctx),
        &LoopOptions::default(),
        &ctx,
        &first,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("first run");

    let second = ScriptedPipeline::new();
    let summary = run_loop(
        &issues,
        &state_path(&ctx),
        &LoopOptions {
            resume: true,
            max_issues: 0,
        },
        &ctx,
        &second,
        &ScriptedWorkTree::new(),
        &RecordingNotifier::new(),
    )
    .expect("second run");

    assert_eq!(summary.run_id, 2);
    assert_eq!(second.started(), vec!["B".to_string()]);
    assert_eq!(second.calls()[0].base_branch, "autopilot/issue-A");
    assert_eq!(summary.counts.completed, 2);
}

/// Switching the repository root releases only local handles bound to a
/// root that is neither the new one nor the workspace root, including when
/// the old root's path contains the key separator.
#[test]
fn repo_root_change_evicts_only_stale_local_handles() {
    let programmer = ScriptedAgent::new("programmer-worker");
    let planner = ScriptedAgent::new("planner-worker");
    let reviewer = ScriptedAgent::new("reviewer-worker");
    let lead = ScriptedAgent::new("lead-worker");
    let (_temp, ctx) = ContextBuilder::new()
        .role("programmer", &programmer)
        .role("planner", &planner)
        .role("reviewer", &reviewer)
        .role("lead", &lead)
        .configure(|config| {
            if let Some(worker) = config.workers.get_mut("reviewer-worker") {
                worker.transport = Transport::Http;
                worker.endpoint = Some("http://127.0.0.1:9/a:3:b".to_string());
            }
        })
        .build()
        .expect("context");
    let root = ctx.workspace_root.clone();
    let tricky = root.join("a:3:b");
    let sibling = root.join("a");

    ctx.pool
        .get_handle("planner", Scope::Workspace, None)
        .expect("planner");
    ctx.set_repo_root(&tricky).expect("switch to tricky root");
    ctx.pool
        .get_handle("programmer", Scope::Repository, None)
        .expect("programmer");
    ctx.pool
        .get_handle("reviewer", Scope::Repository, None)
        .expect("reviewer");
    let stale = PoolKey::for_dir(Transport::Process, "programmer-worker", &tricky);
    assert!(ctx.pool.cached_keys().contains(&stale));
    assert_eq!(PoolKey::decode(&stale.encode()).expect("decode"), stale);

    ctx.set_repo_root(&sibling).expect("switch to sibling");

    let keys = ctx.pool.cached_keys();
    assert!(!keys.contains(&stale));
    assert!(keys.contains(&PoolKey::for_dir(Transport::Process, "planner-worker", &root)));
    assert!(keys.iter().any(|key| key.transport == Transport::Http));
    assert!(programmer.killed());
    assert!(!planner.killed());
    assert!(!reviewer.killed());
    assert_eq!(ctx.repo_root(), sibling);

    // A handle already bound to the new root survives the switch.
    ctx.pool
        .get_handle("lead", Scope::Repository, None)
        .expect("lead");
    let current = PoolKey::for_dir(Transport::Process, "lead-worker", &sibling);
    let evicted = ctx.pool.update_context(&sibling).expect("revalidate sibling");
    assert_eq!(evicted, 0);
    assert!(ctx.pool.cached_keys().contains(&current));
    assert!(!lead.killed());
    assert!(!planner.killed());
}
