//! Working-tree transitions between issues.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::git::Git;

/// Branch handling the loop performs around each issue.
pub trait WorkTree {
    /// Check out `branch`, creating it from `base` when missing.
    fn prepare_branch(&self, branch: &str, base: &str) -> Result<()>;

    /// Commit uncommitted work on `branch`, return to the default branch and
    /// optionally discard what is left. Returns whether a commit was made.
    fn finish_issue(&self, branch: &str, commit_message: &str) -> Result<bool>;

    /// Delete `branch` if it exists and carries no commits beyond the default branch.
    fn prune_empty_branch(&self, branch: &str) -> Result<bool>;

    /// Files changed on `branch` relative to the default branch.
    fn changed_files(&self, branch: &str) -> Result<Vec<String>>;
}

/// `WorkTree` backed by the repository's git CLI.
#[derive(Debug, Clone)]
pub struct GitWorkTree {
    git: Git,
    default_branch: String,
    destructive_reset: bool,
}

impl GitWorkTree {
    pub fn new(git: Git, default_branch: impl Into<String>, destructive_reset: bool) -> Self {
        Self {
            git,
            default_branch: default_branch.into(),
            destructive_reset,
        }
    }

    pub fn default_branch(&self) -> &str {
        &self.default_branch
    }
}

impl WorkTree for GitWorkTree {
    #[instrument(skip_all, fields(branch = %branch, base = %base))]
    fn prepare_branch(&self, branch: &str, base: &str) -> Result<()> {
        if self.git.branch_exists(branch)? {
            debug!("branch exists, checking out");
            return self.git.checkout_branch(branch);
        }
        self.git.checkout_new_branch_from(branch, base)
    }

    #[instrument(skip_all, fields(branch = %branch))]
    fn finish_issue(&self, branch: &str, commit_message: &str) -> Result<bool> {
        let mut committed = false;
        if self.git.current_branch()? == branch && !self.git.is_clean()? {
            self.git.add_all()?;
            committed = self
                .git
                .commit_staged(commit_message)
                .with_context(|| format!("commit partial work on {branch}"))?;
            if committed {
                info!("committed uncommitted work before switching branches");
            }
        }

        if let Err(err) = self.git.checkout_branch(&self.default_branch) {
            // A dirty tree can block the checkout; only a reset can recover.
            if !self.destructive_reset {
                return Err(err);
            }
            warn!(err = %format!("{err:#}"), "checkout failed, resetting first");
            self.git.reset_hard()?;
            self.git.clean_untracked()?;
            self.git.checkout_branch(&self.default_branch)?;
        }

        if self.destructive_reset {
            self.git.reset_hard()?;
            self.git.clean_untracked()?;
        }
        Ok(committed)
    }

    fn prune_empty_branch(&self, branch: &str) -> Result<bool> {
        if !self.git.branch_exists(branch)? {
            return Ok(false);
        }
        if self.git.commits_ahead(&self.default_branch, branch)? > 0 {
            return Ok(false);
        }
        self.git.delete_branch(branch)?;
        Ok(true)
    }

    fn changed_files(&self, branch: &str) -> Result<Vec<String>> {
        self.git.changed_files(&self.default_branch, branch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    fn work_tree(repo: &TestRepo, destructive: bool) -> GitWorkTree {
        let git = Git::new(repo.path());
        let default = git.current_branch().expect("branch");
        GitWorkTree::new(git, default, destructive)
    }

    #[test]
    fn partial_work_is_committed_before_leaving_the_branch() {
        let repo = TestRepo::new().expect("repo");
        let tree = work_tree(&repo, false);
        tree.prepare_branch("autopilot/issue-1", tree.default_branch())
            .expect("prepare");
        fs::write(repo.path().join("wip.txt"), "half done\n").expect("write");

        let committed = tree
            .finish_issue("autopilot/issue-1", "autopilot: partial work for 1")
            .expect("finish");
        assert!(committed);

        let git = Git::new(repo.path());
        assert_eq!(git.current_branch().expect("branch"), tree.default_branch());
        assert_eq!(
            tree.changed_files("autopilot/issue-1").expect("diff"),
            vec!["wip.txt".to_string()]
        );
        assert!(!tree.prune_empty_branch("autopilot/issue-1").expect("prune"));
    }

    #[test]
    fn empty_branches_are_pruned() {
        let repo = TestRepo::new().expect("repo");
        let tree = work_tree(&repo, true);
        tree.prepare_branch("autopilot/issue-2", tree.default_branch())
            .expect("prepare");
        assert!(!tree.finish_issue("autopilot/issue-2", "msg").expect("finish"));
        assert!(tree.prune_empty_branch("autopilot/issue-2").expect("prune"));
        assert!(!Git::new(repo.path())
            .branch_exists("autopilot/issue-2")
            .expect("exists"));
        assert!(!tree.prune_empty_branch("autopilot/missing").expect("prune"));
    }

    #[test]
    fn destructive_reset_drops_untracked_files_on_default_branch() {
        let repo = TestRepo::new().expect("repo");
        let tree = work_tree(&repo, true);
        fs::write(repo.path().join("stray.txt"), "x").expect("write");
        tree.finish_issue("autopilot/issue-3", "msg").expect("finish");
        assert!(!repo.path().join("stray.txt").exists());
    }
}
