//! The dependency-aware batch loop.
//!
//! Issues run strictly one at a time. Every entry transition is persisted
//! before the loop moves on, so the loop state file always reflects the last
//! transition.

pub mod reconcile;
pub mod workspace;

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{ErrorKind, is_rate_limit_message};
use crate::core::dependency::{DependencyDecision, resolve_dependencies};
use crate::core::queue::build_queue;
use crate::core::types::{
    Issue, IssueOutcome, LoopStatus, OutcomeCounts, QueueEntry, QueueStatus,
};
use crate::exit_codes;
use crate::io::loop_state::{LoopState, LoopStore, SaveOutcome};
use crate::io::notify::{LoopEvent, Notifier};
use crate::pipeline::context::RunContext;
use crate::pipeline::runner::{PipelineRun, PipelineStatus};
use crate::pipeline::unit::{ScratchCache, sanitize};
use crate::pipeline::{IssuePipeline, IssueRequest};
use workspace::WorkTree;

#[derive(Debug, Clone, Copy, Default)]
pub struct LoopOptions {
    /// Carry `completed` entries over from the previous run.
    pub resume: bool,
    /// Upper bound on issues taken from the ordered queue; 0 means no cap.
    pub max_issues: usize,
}

/// Aggregate result of one batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopSummary {
    pub run_id: u64,
    pub counts: OutcomeCounts,
    pub cancelled: bool,
    pub diagnostics: Vec<String>,
    pub report_path: Option<PathBuf>,
}

impl LoopSummary {
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            exit_codes::CANCELLED
        } else if self.counts.failed + self.counts.skipped + self.counts.deferred > 0 {
            exit_codes::FAILURES
        } else {
            exit_codes::OK
        }
    }
}

/// A claimed run whose queue is built but not yet processed.
#[derive(Debug)]
pub struct PreparedLoop {
    store: LoopStore,
    state: LoopState,
    known_ids: HashSet<String>,
    cyclic: HashSet<String>,
    outcomes: HashMap<String, IssueOutcome>,
}

/// Order `issues`, claim the next run id and persist the initial state.
#[instrument(skip_all, fields(issues = issues.len(), resume = options.resume))]
pub fn prepare_loop(
    issues: &[Issue],
    state_path: &Path,
    options: &LoopOptions,
) -> Result<PreparedLoop> {
    let plan = build_queue(issues);
    let mut diagnostics = plan.diagnostics;
    let cyclic: HashSet<String> = plan.cyclic.into_iter().collect();
    let mut order = plan.order;
    if options.max_issues > 0 && order.len() > options.max_issues {
        diagnostics.push(format!(
            "batch capped at {} issue(s); {} left for a later run",
            options.max_issues,
            order.len() - options.max_issues
        ));
        order.truncate(options.max_issues);
    }
    for note in &diagnostics {
        warn!(note = %note, "queue diagnostic");
    }

    let known_ids: HashSet<String> = order.iter().map(|issue| issue.id.clone()).collect();
    let entries = order.into_iter().map(QueueEntry::new).collect();
    let (store, mut state, previous) = LoopStore::claim(state_path, entries)?;

    let mut outcomes = HashMap::new();
    if options.resume {
        match previous {
            Some(previous) => {
                let carried = carry_completed(&mut state.entries, &previous.entries);
                for entry in &state.entries {
                    if entry.status == QueueStatus::Completed {
                        outcomes.insert(
                            entry.issue.id.clone(),
                            IssueOutcome {
                                status: QueueStatus::Completed,
                                branch: entry.branch.clone(),
                            },
                        );
                    }
                }
                info!(carried, previous_run = previous.run_id, "resuming");
                diagnostics.push(format!(
                    "resumed {carried} completed issue(s) from run {}",
                    previous.run_id
                ));
            }
            None => diagnostics.push("nothing to resume; starting fresh".to_string()),
        }
    }
    state.diagnostics = diagnostics;
    store.save(&mut state)?;

    Ok(PreparedLoop {
        store,
        state,
        known_ids,
        cyclic,
        outcomes,
    })
}

fn carry_completed(entries: &mut [QueueEntry], previous: &[QueueEntry]) -> usize {
    let completed: HashMap<&str, &QueueEntry> = previous
        .iter()
        .filter(|entry| entry.status == QueueStatus::Completed)
        .map(|entry| (entry.issue.id.as_str(), entry))
        .collect();
    let mut carried = 0;
    for entry in entries.iter_mut() {
        if let Some(done) = completed.get(entry.issue.id.as_str()) {
            let issue = entry.issue.clone();
            *entry = QueueEntry {
                issue,
                ..(*done).clone()
            };
            carried += 1;
        }
    }
    carried
}

impl PreparedLoop {
    pub fn run_id(&self) -> u64 {
        self.store.run_id()
    }

    pub fn state(&self) -> &LoopState {
        &self.state
    }

    /// Process the queue: main pass, retry pass, then reconciliation.
    ///
    /// Individual issue failures never abort the batch.
    #[instrument(skip_all, fields(run_id = self.store.run_id()))]
    pub fn run<P, W, N>(
        self,
        ctx: &RunContext,
        pipeline: &P,
        work_tree: &W,
        notifier: &N,
    ) -> LoopSummary
    where
        P: IssuePipeline + ?Sized,
        W: WorkTree + ?Sized,
        N: Notifier + ?Sized,
    {
        let mut lp = Loop {
            ctx,
            pipeline,
            work_tree,
            notifier,
            store: self.store,
            state: self.state,
            known_ids: self.known_ids,
            cyclic: self.cyclic,
            outcomes: self.outcomes,
        };
        lp.run()
    }
}

/// Convenience wrapper: prepare and run in one call.
pub fn run_loop<P, W, N>(
    issues: &[Issue],
    state_path: &Path,
    options: &LoopOptions,
    ctx: &RunContext,
    pipeline: &P,
    work_tree: &W,
    notifier: &N,
) -> Result<LoopSummary>
where
    P: IssuePipeline + ?Sized,
    W: WorkTree + ?Sized,
    N: Notifier + ?Sized,
{
    let prepared = prepare_loop(issues, state_path, options)?;
    Ok(prepared.run(ctx, pipeline, work_tree, notifier))
}

struct Loop<'a, P: ?Sized, W: ?Sized, N: ?Sized> {
    ctx: &'a RunContext,
    pipeline: &'a P,
    work_tree: &'a W,
    notifier: &'a N,
    store: LoopStore,
    state: LoopState,
    known_ids: HashSet<String>,
    cyclic: HashSet<String>,
    outcomes: HashMap<String, IssueOutcome>,
}

impl<P, W, N> Loop<'_, P, W, N>
where
    P: IssuePipeline + ?Sized,
    W: WorkTree + ?Sized,
    N: Notifier + ?Sized,
{
    fn run(&mut self) -> LoopSummary {
        let run_id = self.store.run_id();
        self.announce(LoopEvent::LoopStart {
            run_id,
            issues: self.state.entries.len(),
        });

        let mut cancelled = self.pass(true);
        if !cancelled {
            cancelled = self.pass(false);
        }

        let report_path = self.reconcile();

        self.state.status = if cancelled {
            LoopStatus::Cancelled
        } else {
            LoopStatus::Completed
        };
        self.state.current_index = None;
        self.state.finished_at = Some(Utc::now());
        self.persist();

        let counts = OutcomeCounts::tally(&self.state.entries);
        info!(
            completed = counts.completed,
            failed = counts.failed,
            skipped = counts.skipped,
            deferred = counts.deferred,
            cancelled,
            "loop finished"
        );
        self.announce(LoopEvent::LoopComplete {
            run_id,
            counts,
            cancelled,
        });
        LoopSummary {
            run_id,
            counts,
            cancelled,
            diagnostics: self.state.diagnostics.clone(),
            report_path,
        }
    }

    /// One sweep over the queue. The main pass takes `pending` entries, the
    /// retry pass takes `deferred` ones. Returns whether it was cancelled.
    fn pass(&mut self, first_pass: bool) -> bool {
        let wanted = if first_pass {
            QueueStatus::Pending
        } else {
            QueueStatus::Deferred
        };
        debug!(first_pass, "starting pass");
        for index in 0..self.state.entries.len() {
            if self.ctx.cancel.is_cancelled() {
                info!(first_pass, "cancellation requested, stopping pass");
                return true;
            }
            if self.state.entries[index].status != wanted {
                continue;
            }
            self.process(index, first_pass);
        }
        false
    }

    #[instrument(skip_all, fields(issue = %self.state.entries[index].issue.id, first_pass = first_pass))]
    fn process(&mut self, index: usize, first_pass: bool) {
        let issue = self.state.entries[index].issue.clone();
        let decision = resolve_dependencies(
            &issue,
            &self.known_ids,
            &self.cyclic,
            &self.outcomes,
            first_pass,
        );
        let base_branch = match decision {
            DependencyDecision::Skip { reason } => {
                info!(reason = %reason, "skipping issue");
                self.finish_entry(index, QueueStatus::Skipped, Some(reason.clone()));
                self.announce(LoopEvent::IssueSkipped {
                    issue_id: issue.id,
                    reason,
                });
                return;
            }
            DependencyDecision::Defer { waiting_on } => {
                let reason = format!("waiting on {}", waiting_on.join(", "));
                info!(reason = %reason, "deferring issue");
                self.defer_entry(index, &issue, reason);
                return;
            }
            DependencyDecision::Ready { base_branch } => base_branch.unwrap_or_else(|| {
                self.ctx.config.loop_settings.default_branch.clone()
            }),
        };

        let branch = format!(
            "{}{}",
            self.ctx.config.loop_settings.branch_prefix,
            sanitize(&issue.id)
        );
        {
            let entry = &mut self.state.entries[index];
            entry.status = QueueStatus::InProgress;
            entry.passes += 1;
            entry.started_at = Some(Utc::now());
            entry.finished_at = None;
            entry.error = None;
            entry.branch = Some(branch.clone());
            entry.base_branch = Some(base_branch.clone());
        }
        self.state.current_index = Some(index);
        self.persist();
        self.announce(LoopEvent::IssueStart {
            issue_id: issue.id.clone(),
            retry_pass: !first_pass,
        });

        let run = match self.work_tree.prepare_branch(&branch, &base_branch) {
            Ok(()) => self.run_pipeline(&issue, &branch, &base_branch),
            Err(err) => PipelineRun::failed(format!("prepare branch {branch}: {err:#}"), None),
        };
        self.record_outcome(index, &issue, &branch, &run, first_pass);

        let message = format!(
            "autopilot: {} work for issue {}",
            self.state.entries[index].status.as_str(),
            issue.id
        );
        if let Err(err) = self.work_tree.finish_issue(&branch, &message) {
            warn!(err = %format!("{err:#}"), "failed to reset working tree after issue");
        }
    }

    /// Run the pipeline, rerunning it for generic failures within the budget.
    fn run_pipeline(&self, issue: &Issue, branch: &str, base_branch: &str) -> PipelineRun {
        let budget = self.ctx.config.loop_settings.max_pipeline_retries;
        let mut attempt = 1;
        loop {
            let request = IssueRequest {
                issue,
                branch,
                base_branch,
                attempt,
            };
            let run = self.pipeline.run_issue(&request, self.ctx);
            if run.status != PipelineStatus::Failed || is_rate_limited(&run) {
                return run;
            }
            if attempt > budget || self.ctx.cancel.is_cancelled() {
                return run;
            }
            warn!(
                attempt,
                budget,
                err = run.error.as_deref().unwrap_or_default(),
                "pipeline failed, rerunning"
            );
            self.ctx.events.record(
                "pipeline_retry",
                &json!({"issue_id": issue.id, "attempt": attempt, "error": run.error}),
            );
            attempt += 1;
        }
    }

    fn record_outcome(
        &mut self,
        index: usize,
        issue: &Issue,
        branch: &str,
        run: &PipelineRun,
        first_pass: bool,
    ) {
        let error = run.error.clone().unwrap_or_else(|| "pipeline failed".to_string());
        match run.status {
            PipelineStatus::Completed => {
                let pr = run.pr_reference();
                self.state.entries[index].pr = pr.clone();
                self.outcomes.insert(
                    issue.id.clone(),
                    IssueOutcome {
                        status: QueueStatus::Completed,
                        branch: Some(branch.to_string()),
                    },
                );
                self.finish_entry(index, QueueStatus::Completed, None);
                info!(pr = ?pr, "issue completed");
                if let Err(err) = ScratchCache::new(&self.ctx.scratch_dir, &issue.id).clear() {
                    warn!(err = %format!("{err:#}"), "failed to clear scratch outputs");
                }
                self.announce(LoopEvent::IssueComplete {
                    issue_id: issue.id.clone(),
                    branch: Some(branch.to_string()),
                    pr,
                });
            }
            PipelineStatus::Cancelled => {
                self.defer_entry(index, issue, error);
            }
            PipelineStatus::Failed if first_pass && is_rate_limited(run) => {
                info!(err = %error, "rate limited, deferring to retry pass");
                self.defer_entry(index, issue, error);
            }
            PipelineStatus::Failed => {
                warn!(err = %error, "issue failed");
                self.outcomes.insert(
                    issue.id.clone(),
                    IssueOutcome {
                        status: QueueStatus::Failed,
                        branch: Some(branch.to_string()),
                    },
                );
                self.finish_entry(index, QueueStatus::Failed, Some(error.clone()));
                self.announce(LoopEvent::IssueFailed {
                    issue_id: issue.id.clone(),
                    error,
                });
            }
        }
    }

    fn defer_entry(&mut self, index: usize, issue: &Issue, reason: String) {
        let entry = &mut self.state.entries[index];
        entry.status = QueueStatus::Deferred;
        entry.error = Some(reason.clone());
        self.persist();
        self.announce(LoopEvent::IssueDeferred {
            issue_id: issue.id.clone(),
            reason,
        });
    }

    /// Terminal transition: record status and error, persist.
    fn finish_entry(&mut self, index: usize, status: QueueStatus, error: Option<String>) {
        let entry = &mut self.state.entries[index];
        entry.status = status;
        entry.error = error;
        entry.finished_at = Some(Utc::now());
        if status == QueueStatus::Skipped {
            self.outcomes.insert(
                entry.issue.id.clone(),
                IssueOutcome {
                    status,
                    branch: None,
                },
            );
        }
        self.persist();
    }

    fn reconcile(&mut self) -> Option<PathBuf> {
        let pruned = reconcile::prune_empty_branches(&mut self.state.entries, self.work_tree);
        if !pruned.is_empty() {
            self.ctx
                .events
                .record("branches_pruned", &json!({"branches": pruned}));
            self.persist();
        }
        match reconcile::write_integration_report(
            &self.state.entries,
            self.work_tree,
            self.store.run_id(),
            &self.ctx.artifacts_dir,
        ) {
            Ok(path) => path,
            Err(err) => {
                warn!(err = %format!("{err:#}"), "integration report failed");
                None
            }
        }
    }

    fn persist(&mut self) {
        match self.store.save(&mut self.state) {
            Ok(SaveOutcome::Written) => {}
            Ok(SaveOutcome::Superseded { on_disk }) => {
                warn!(on_disk, "loop state superseded by a newer run");
            }
            Err(err) => warn!(err = %format!("{err:#}"), "failed to persist loop state"),
        }
    }

    fn announce(&self, event: LoopEvent) {
        self.ctx.events.record(event.name(), &event);
        if let Err(err) = self.notifier.notify(&event) {
            warn!(event = event.name(), err = %format!("{err:#}"), "notification failed");
        }
    }
}

fn is_rate_limited(run: &PipelineRun) -> bool {
    run.error_kind == Some(ErrorKind::RateLimit)
        || run.error.as_deref().is_some_and(is_rate_limit_message)
}
