//! Configured `[[stages]]` as prompt units, and the per-issue pipeline built from them.

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use super::context::RunContext;
use super::runner::{PipelineRun, Stage, run_stages};
use super::unit::{ScratchCache, Unit, UnitOutput};
use super::{IssuePipeline, IssueRequest};
use crate::io::config::StageConfig;

/// Renders a stage template and asks the stage's role for structured output.
pub struct PromptUnit {
    stage: StageConfig,
    env: Environment<'static>,
    cache: ScratchCache,
    schema: Value,
}

impl PromptUnit {
    pub fn new(stage: StageConfig, cache: ScratchCache) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template_owned(stage.name.clone(), stage.template.clone())
            .with_context(|| format!("compile template for stage '{}'", stage.name))?;
        Ok(Self {
            stage,
            env,
            cache,
            schema: json!({
                "type": "object",
                "required": ["issue", "branch", "base_branch"],
                "properties": {
                    "issue": {
                        "type": "object",
                        "required": ["id", "title"],
                        "properties": {"id": {"type": "string", "minLength": 1}},
                    },
                    "branch": {"type": "string", "minLength": 1},
                    "base_branch": {"type": "string", "minLength": 1},
                },
            }),
        })
    }

    fn render(&self, input: &Value) -> Result<String> {
        let template = self.env.get_template(&self.stage.name)?;
        let rendered = template.render(context! {
            issue => &input["issue"],
            branch => &input["branch"],
            base_branch => &input["base_branch"],
            input => &input["previous"],
        })?;
        Ok(rendered)
    }

    /// Stages may report a repository sub-path; adopt it as the active root.
    fn adopt_repo_path(&self, output: &Value, ctx: &RunContext) -> Result<()> {
        if let Some(rel) = output.get("repo_path").and_then(Value::as_str) {
            ctx.set_repo_root(&ctx.workspace_root.join(rel))
                .with_context(|| format!("stage '{}' repo_path '{rel}'", self.stage.name))?;
        }
        Ok(())
    }
}

impl Unit for PromptUnit {
    fn name(&self) -> &str {
        &self.stage.name
    }

    fn input_schema(&self) -> &Value {
        &self.schema
    }

    #[instrument(skip_all, fields(stage = %self.stage.name, role = %self.stage.role))]
    fn execute(&self, input: &Value, ctx: &RunContext) -> Result<UnitOutput> {
        if let Some(cached) = self.cache.load(&self.stage.name) {
            debug!("stage output already cached, skipping worker");
            self.adopt_repo_path(&cached, ctx)?;
            return Ok(UnitOutput::ok(cached));
        }

        let prompt = self.render(input)?;
        let (worker, handle) = ctx
            .pool
            .get_handle(&self.stage.role, self.stage.scope, None)
            .with_context(|| format!("resolve role '{}'", self.stage.role))?;
        info!(worker = %worker, "running stage");
        let mut options = ctx.exec_options(self.stage.scope);
        if let Some(issue_id) = input["issue"]["id"].as_str() {
            options.stream_path = ctx.stream_path(issue_id, &self.stage.name);
        }
        let output = handle.execute_structured(&prompt, &options)?;

        self.cache
            .store(&self.stage.name, &output)
            .with_context(|| format!("cache output of stage '{}'", self.stage.name))?;
        self.adopt_repo_path(&output, ctx)?;
        Ok(UnitOutput::ok(output))
    }
}

/// Runs the configured stage list for one issue.
#[derive(Debug, Clone)]
pub struct StagedPipeline {
    stages: Vec<StageConfig>,
}

impl StagedPipeline {
    pub fn new(stages: Vec<StageConfig>) -> Self {
        Self { stages }
    }

    fn build(&self, request: &IssueRequest<'_>, ctx: &RunContext) -> Result<Vec<Stage>> {
        let base = json!({
            "issue": request.issue,
            "branch": request.branch,
            "base_branch": request.base_branch,
        });
        let cache = ScratchCache::new(&ctx.scratch_dir, &request.issue.id);
        self.stages
            .iter()
            .map(|config| {
                let unit = PromptUnit::new(config.clone(), cache.clone())?;
                let base = base.clone();
                Ok(Stage::new(unit).with_input(move |previous, _| {
                    let mut input = base.clone();
                    input["previous"] = previous.clone();
                    input
                }))
            })
            .collect()
    }
}

impl IssuePipeline for StagedPipeline {
    fn run_issue(&self, request: &IssueRequest<'_>, ctx: &RunContext) -> PipelineRun {
        let stages = match self.build(request, ctx) {
            Ok(stages) => stages,
            Err(err) => return PipelineRun::failed(format!("{err:#}"), None),
        };
        let issue_id = request.issue.id.clone();
        run_stages(&stages, Value::Null, ctx, &mut |event| {
            debug!(issue = %issue_id, event = ?event, "stage transition");
        })
    }
}
