//! Dependency gating for a single queue entry.

use std::collections::{HashMap, HashSet};

use crate::core::queue::known_dependencies;
use crate::core::types::{Issue, IssueOutcome, QueueStatus};

/// Reason recorded on entries skipped because nothing they depend on succeeded.
pub const ALL_DEPENDENCIES_FAILED: &str = "all dependencies failed";

/// Reason recorded on entries that sit in, or behind, a dependency cycle.
pub const DEPENDENCY_CYCLE: &str = "blocked by a dependency cycle";

/// What the loop should do with an issue before running its pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyDecision {
    /// Run the pipeline. `base_branch` is the branch of a succeeded dependency,
    /// or `None` to start from the default branch.
    Ready { base_branch: Option<String> },
    /// Terminal: no known dependency succeeded.
    Skip { reason: String },
    /// Revisit in the retry pass.
    Defer { waiting_on: Vec<String> },
}

/// Decide how to treat `issue` given the outcomes observed so far.
///
/// On the first pass an unobserved known dependency defers the issue. On the
/// retry pass unobserved dependencies count as failed. Dependencies outside
/// `known_ids` never block. Issues listed in `cyclic` are skipped with
/// [`DEPENDENCY_CYCLE`] instead of [`ALL_DEPENDENCIES_FAILED`].
pub fn resolve_dependencies(
    issue: &Issue,
    known_ids: &HashSet<String>,
    cyclic: &HashSet<String>,
    outcomes: &HashMap<String, IssueOutcome>,
    first_pass: bool,
) -> DependencyDecision {
    let known = known_dependencies(issue, known_ids);
    if known.is_empty() {
        return DependencyDecision::Ready { base_branch: None };
    }

    let mut observed = Vec::new();
    let mut waiting_on = Vec::new();
    for dep in &known {
        match outcomes.get(*dep) {
            Some(outcome) => observed.push((*dep, outcome)),
            None => waiting_on.push(dep.to_string()),
        }
    }

    let all_observed_failed = observed
        .iter()
        .all(|(_, outcome)| outcome.status.is_unsuccessful());
    // With nothing observed yet, only the retry pass may conclude the issue is blocked.
    if all_observed_failed && (!observed.is_empty() || !first_pass) {
        let reason = if cyclic.contains(&issue.id) {
            DEPENDENCY_CYCLE
        } else {
            ALL_DEPENDENCIES_FAILED
        };
        return DependencyDecision::Skip {
            reason: reason.to_string(),
        };
    }

    if first_pass && !waiting_on.is_empty() {
        return DependencyDecision::Defer { waiting_on };
    }

    let base_branch = observed
        .iter()
        .find(|(_, outcome)| outcome.status == QueueStatus::Completed)
        .and_then(|(_, outcome)| outcome.branch.clone());
    DependencyDecision::Ready { base_branch }
}
