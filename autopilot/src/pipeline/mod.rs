//! Units of work, the run context they share, and the stage runner.

pub mod context;
pub mod prompt_stage;
pub mod runner;
pub mod unit;

use crate::core::types::Issue;
use context::RunContext;
use runner::PipelineRun;

/// What the loop hands a pipeline for one issue.
#[derive(Debug, Clone, Copy)]
pub struct IssueRequest<'a> {
    pub issue: &'a Issue,
    pub branch: &'a str,
    pub base_branch: &'a str,
    /// 1-based pipeline attempt within the current pass.
    pub attempt: u32,
}

/// Runs the full stage list for a single issue.
pub trait IssuePipeline {
    fn run_issue(&self, request: &IssueRequest<'_>, ctx: &RunContext) -> PipelineRun;
}
