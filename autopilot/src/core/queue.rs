//! Deterministic execution ordering for a batch of issues.

use std::collections::{BTreeSet, HashMap, HashSet};

use crate::core::types::Issue;

/// Ordered issues plus any problems found while ordering them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePlan {
    pub order: Vec<Issue>,
    /// Human-readable notes about cycles or dangling edges. Never fatal.
    pub diagnostics: Vec<String>,
    /// Ids that could not be ordered because they sit in, or behind, a cycle.
    pub cyclic: Vec<String>,
}

/// Build the execution order for `issues`.
///
/// - No issue declares a dependency: stable ascending sort by difficulty.
/// - Otherwise: topological order over edges between known ids. Among ready
///   issues the lowest `(difficulty, input position)` goes first. Issues caught
///   in a cycle are appended in input order and reported in `diagnostics`.
///
/// Dependencies on ids outside the batch are ignored for ordering.
pub fn build_queue(issues: &[Issue]) -> QueuePlan {
    if issues.iter().all(|issue| issue.depends_on.is_empty()) {
        let mut order = issues.to_vec();
        order.sort_by_key(|issue| issue.difficulty);
        return QueuePlan {
            order,
            diagnostics: Vec::new(),
            cyclic: Vec::new(),
        };
    }

    let mut diagnostics = Vec::new();
    let mut index_of: HashMap<&str, usize> = HashMap::new();
    for (idx, issue) in issues.iter().enumerate() {
        if index_of.insert(issue.id.as_str(), idx).is_some() {
            diagnostics.push(format!("duplicate issue id '{}'", issue.id));
        }
    }

    let mut in_degree = vec![0usize; issues.len()];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); issues.len()];
    for (idx, issue) in issues.iter().enumerate() {
        for dep in &issue.depends_on {
            match index_of.get(dep.as_str()) {
                Some(&dep_idx) if dep_idx == idx => {
                    diagnostics.push(format!("issue '{}' depends on itself", issue.id));
                }
                Some(&dep_idx) => {
                    in_degree[idx] += 1;
                    dependents[dep_idx].push(idx);
                }
                None => {}
            }
        }
    }

    let rank = |idx: usize| (issues[idx].difficulty, idx);
    let mut ready: BTreeSet<(u32, usize)> = (0..issues.len())
        .filter(|&idx| in_degree[idx] == 0)
        .map(rank)
        .collect();

    let mut placed = HashSet::new();
    let mut order = Vec::with_capacity(issues.len());
    while let Some(next) = ready.pop_first() {
        let idx = next.1;
        placed.insert(idx);
        order.push(issues[idx].clone());
        for &dependent in &dependents[idx] {
            in_degree[dependent] = in_degree[dependent].saturating_sub(1);
            if in_degree[dependent] == 0 {
                ready.insert(rank(dependent));
            }
        }
    }

    let mut cyclic = Vec::new();
    if order.len() < issues.len() {
        cyclic = (0..issues.len())
            .filter(|idx| !placed.contains(idx))
            .map(|idx| issues[idx].id.clone())
            .collect();
        diagnostics.push(format!(
            "dependency cycle among issues: {}",
            cyclic.join(", ")
        ));
        for (idx, issue) in issues.iter().enumerate() {
            if !placed.contains(&idx) {
                order.push(issue.clone());
            }
        }
    }

    QueuePlan {
        order,
        diagnostics,
        cyclic,
    }
}

/// Ids in `issue.depends_on` that refer to issues in the batch, in declared
/// order with repeats dropped.
pub fn known_dependencies<'a>(issue: &'a Issue, known_ids: &HashSet<String>) -> Vec<&'a str> {
    let mut seen = HashSet::new();
    issue
        .depends_on
        .iter()
        .map(String::as_str)
        .filter(|dep| known_ids.contains(*dep) && *dep != issue.id && seen.insert(*dep))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Issue;

    fn issue(id: &str, difficulty: u32, deps: &[&str]) -> Issue {
        Issue {
            id: id.to_string(),
            title: format!("{id} title"),
            difficulty,
            depends_on: deps.iter().map(|d| d.to_string()).collect(),
            body: None,
        }
    }

    fn ids(plan: &QueuePlan) -> Vec<&str> {
        plan.order.iter().map(|i| i.id.as_str()).collect()
    }

    fn position(plan: &QueuePlan, id: &str) -> usize {
        plan.order
            .iter()
            .position(|i| i.id == id)
            .expect("issue present")
    }

    #[test]
    fn without_dependencies_sorts_by_difficulty_stably() {
        let plan = build_queue(&[
            issue("a", 3, &[]),
            issue("b", 1, &[]),
            issue("c", 3, &[]),
            issue("d", 1, &[]),
        ]);
        assert_eq!(ids(&plan), vec!["b", "d", "a", "c"]);
        assert!(plan.diagnostics.is_empty());
    }

    #[test]
    fn dependencies_come_before_dependents() {
        let plan = build_queue(&[
            issue("c", 0, &["b"]),
            issue("b", 5, &["a"]),
            issue("a", 9, &[]),
            issue("d", 1, &["a", "c"]),
        ]);
        assert_eq!(plan.order.len(), 4);
        assert!(position(&plan, "a") < position(&plan, "b"));
        assert!(position(&plan, "b") < position(&plan, "c"));
        assert!(position(&plan, "c") < position(&plan, "d"));
        assert!(plan.diagnostics.is_empty());
    }

    #[test]
    fn unknown_dependencies_do_not_block_ordering() {
        let plan = build_queue(&[
            issue("a", 2, &[]),
            issue("b", 1, &["a"]),
            issue("c", 0, &["missing"]),
        ]);
        assert_eq!(ids(&plan), vec!["c", "a", "b"]);
        assert!(plan.diagnostics.is_empty());
    }

    #[test]
    fn cycles_are_reported_and_still_placed() {
        let plan = build_queue(&[
            issue("a", 0, &[]),
            issue("x", 0, &["y"]),
            issue("y", 0, &["x"]),
        ]);
        assert_eq!(ids(&plan), vec!["a", "x", "y"]);
        assert_eq!(plan.diagnostics.len(), 1);
        assert!(plan.diagnostics[0].contains("cycle"));
        assert!(plan.diagnostics[0].contains("x, y"));
        assert_eq!(plan.cyclic, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn self_dependency_is_diagnosed() {
        let plan = build_queue(&[issue("a", 0, &["a"]), issue("b", 0, &[])]);
        assert_eq!(ids(&plan), vec!["a", "b"]);
        assert_eq!(plan.diagnostics, vec!["issue 'a' depends on itself"]);
    }

    #[test]
    fn known_dependencies_filters_external_ids() {
        let known: HashSet<String> = ["a".to_string(), "b".to_string()].into_iter().collect();
        let target = issue("b", 0, &["a", "zzz"]);
        assert_eq!(known_dependencies(&target, &known), vec!["a"]);
    }

    #[test]
    fn known_dependencies_keep_declared_order() {
        let known: HashSet<String> = ["zeta", "alpha", "c"].iter().map(|id| id.to_string()).collect();
        let target = issue("c", 0, &["zeta", "alpha", "zeta"]);
        assert_eq!(known_dependencies(&target, &known), vec!["zeta", "alpha"]);
    }

    #[test]
    fn repeated_edges_still_order_dependents() {
        let plan = build_queue(&[issue("b", 0, &["a", "a"]), issue("a", 1, &[])]);
        assert_eq!(ids(&plan), vec!["a", "b"]);
        assert!(plan.cyclic.is_empty());
    }
}
