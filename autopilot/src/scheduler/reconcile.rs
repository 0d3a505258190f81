//! Post-loop cleanup: prune empty branches and report cross-branch overlaps.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::{info, instrument, warn};

use super::workspace::WorkTree;
use crate::core::types::{QueueEntry, QueueStatus};

const REPORT_TEMPLATE: &str = "\
# Integration report for run {{ run_id }}

Completed branches:
{% for branch in branches %}
- `{{ branch.branch }}` (issue {{ branch.issue_id }}): {{ branch.files | length }} file(s) changed
{%- endfor %}

{% if overlaps %}## Overlapping changes
{% for overlap in overlaps %}
### `{{ overlap.left }}` and `{{ overlap.right }}`
{% for file in overlap.files %}
- {{ file }}
{%- endfor %}
{% endfor %}{% else %}No completed branches touch the same files.
{% endif %}";

#[derive(Debug, Clone, Serialize)]
struct BranchChanges {
    issue_id: String,
    branch: String,
    files: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Overlap {
    pub left: String,
    pub right: String,
    pub files: Vec<String>,
}

/// Delete branches of failed and skipped entries that carry no commits.
///
/// Branches with commits are kept for manual recovery. Returns the pruned branches.
#[instrument(skip_all)]
pub fn prune_empty_branches<W: WorkTree + ?Sized>(
    entries: &mut [QueueEntry],
    work_tree: &W,
) -> Vec<String> {
    let mut pruned = Vec::new();
    for entry in entries.iter_mut() {
        if !entry.status.is_unsuccessful() {
            continue;
        }
        let Some(branch) = entry.branch.clone() else {
            continue;
        };
        match work_tree.prune_empty_branch(&branch) {
            Ok(true) => {
                info!(issue = %entry.issue.id, branch = %branch, "deleted empty branch");
                entry.branch = None;
                pruned.push(branch);
            }
            Ok(false) => {}
            Err(err) => {
                warn!(branch = %branch, err = %format!("{err:#}"), "failed to prune branch");
            }
        }
    }
    pruned
}

/// Write the integration report when at least two issues completed.
///
/// Returns the report path, or `None` when there was nothing to compare.
#[instrument(skip_all, fields(run_id = run_id))]
pub fn write_integration_report<W: WorkTree + ?Sized>(
    entries: &[QueueEntry],
    work_tree: &W,
    run_id: u64,
    artifacts_dir: &Path,
) -> Result<Option<PathBuf>> {
    let mut branches = Vec::new();
    for entry in entries {
        if entry.status != QueueStatus::Completed {
            continue;
        }
        let Some(branch) = &entry.branch else {
            continue;
        };
        let files = work_tree
            .changed_files(branch)
            .with_context(|| format!("diff branch {branch}"))?;
        branches.push(BranchChanges {
            issue_id: entry.issue.id.clone(),
            branch: branch.clone(),
            files: files.into_iter().collect(),
        });
    }
    if branches.len() < 2 {
        return Ok(None);
    }

    let overlaps = pairwise_overlaps(&branches);
    let overlap_count = overlaps.len();
    let mut env = Environment::new();
    env.add_template("report", REPORT_TEMPLATE)?;
    let rendered = env.get_template("report")?.render(context! {
        run_id,
        branches,
        overlaps,
    })?;

    let path = artifacts_dir.join(format!("integration-{run_id}.md"));
    crate::io::write_atomic(&path, &rendered)?;
    info!(path = %path.display(), overlaps = overlap_count, "wrote integration report");
    Ok(Some(path))
}

fn pairwise_overlaps(branches: &[BranchChanges]) -> Vec<Overlap> {
    let mut overlaps = Vec::new();
    for (i, left) in branches.iter().enumerate() {
        for right in &branches[i + 1..] {
            let files: Vec<String> = left.files.intersection(&right.files).cloned().collect();
            if !files.is_empty() {
                overlaps.push(Overlap {
                    left: left.branch.clone(),
                    right: right.branch.clone(),
                    files,
                });
            }
        }
    }
    overlaps
}
