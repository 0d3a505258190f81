//! Issue sources for a batch.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;

use crate::core::types::Issue;

/// Lists the issues a batch should work through.
pub trait IssueSource {
    fn list_issues(&self) -> Result<Vec<Issue>>;
}

/// Issues read from a JSON file: either an array or `{ "issues": [...] }`.
#[derive(Debug, Clone)]
pub struct JsonIssueFile {
    path: PathBuf,
}

impl JsonIssueFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IssueDocument {
    List(Vec<Issue>),
    Wrapped { issues: Vec<Issue> },
}

impl IssueSource for JsonIssueFile {
    fn list_issues(&self) -> Result<Vec<Issue>> {
        parse_issues(&self.path)
    }
}

impl IssueSource for Vec<Issue> {
    fn list_issues(&self) -> Result<Vec<Issue>> {
        Ok(self.clone())
    }
}

fn parse_issues(path: &Path) -> Result<Vec<Issue>> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read issues {}", path.display()))?;
    let doc: IssueDocument = serde_json::from_str(&contents)
        .with_context(|| format!("parse issues {}", path.display()))?;
    let issues = match doc {
        IssueDocument::List(issues) | IssueDocument::Wrapped { issues } => issues,
    };
    for issue in &issues {
        if issue.id.trim().is_empty() {
            return Err(anyhow!("issue with empty id in {}", path.display()));
        }
    }
    Ok(issues)
}
