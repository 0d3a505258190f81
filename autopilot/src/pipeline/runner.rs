//! Sequential stage runner.

use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use super::context::RunContext;
use super::unit::{Unit, UnitResult, run_unit};
use crate::core::classifier::ErrorKind;
use crate::core::types::UnitStatus;

/// Builds a unit's input from the previous unit's data and the results so far.
pub type InputMapper = Box<dyn Fn(&Value, &[StageResult]) -> Value + Send + Sync>;

/// One entry of an ordered pipeline.
pub struct Stage {
    pub unit: Box<dyn Unit + Send + Sync>,
    input: Option<InputMapper>,
}

impl Stage {
    pub fn new(unit: impl Unit + Send + Sync + 'static) -> Self {
        Self {
            unit: Box::new(unit),
            input: None,
        }
    }

    /// Derive this stage's input instead of passing the previous data through.
    pub fn with_input(
        mut self,
        mapper: impl Fn(&Value, &[StageResult]) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.input = Some(Box::new(mapper));
        self
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub result: UnitResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Outcome of one pipeline run, with the results of every stage that ran.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub status: PipelineStatus,
    pub results: Vec<StageResult>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
}

impl PipelineRun {
    pub fn completed(results: Vec<StageResult>) -> Self {
        Self {
            status: PipelineStatus::Completed,
            results,
            error: None,
            error_kind: None,
        }
    }

    pub fn failed(error: impl Into<String>, error_kind: Option<ErrorKind>) -> Self {
        Self {
            status: PipelineStatus::Failed,
            results: Vec::new(),
            error: Some(error.into()),
            error_kind,
        }
    }

    pub fn cancelled(results: Vec<StageResult>) -> Self {
        Self {
            status: PipelineStatus::Cancelled,
            results,
            error: Some("cancelled".to_string()),
            error_kind: None,
        }
    }

    /// PR reference reported by any stage (`pr_url` or `pr`), last one wins.
    pub fn pr_reference(&self) -> Option<String> {
        self.results.iter().rev().find_map(|stage| {
            ["pr_url", "pr"]
                .iter()
                .find_map(|key| stage.result.data.get(key).and_then(Value::as_str))
                .map(str::to_string)
        })
    }
}

/// Stage transition reported to observers.
#[derive(Debug, Clone, Copy)]
pub enum StageEvent<'a> {
    Started { stage: &'a str, index: usize },
    Finished { stage: &'a str, result: &'a UnitResult },
    Paused { stage: &'a str },
    Cancelled { stage: &'a str },
}

impl StageEvent<'_> {
    fn record(&self, ctx: &RunContext) {
        match self {
            StageEvent::Started { stage, index } => {
                ctx.events
                    .record("stage_start", &json!({"stage": stage, "index": index}));
            }
            StageEvent::Finished { stage, result } => {
                ctx.events.record(
                    "stage_finish",
                    &json!({
                        "stage": stage,
                        "status": result.status,
                        "error": result.error,
                        "duration_ms": result.duration_ms,
                    }),
                );
            }
            StageEvent::Paused { stage } => {
                ctx.events.record("stage_paused", &json!({"stage": stage}));
            }
            StageEvent::Cancelled { stage } => {
                ctx.events.record("stage_cancelled", &json!({"stage": stage}));
            }
        }
    }
}

/// Run `stages` strictly in order, threading each stage's data into the next.
///
/// The cancel token is checked before every stage; a paused token blocks
/// until resumed or cancelled. The first stage error stops the run.
#[instrument(skip_all, fields(stages = stages.len()))]
pub fn run_stages(
    stages: &[Stage],
    initial: Value,
    ctx: &RunContext,
    observer: &mut dyn FnMut(&StageEvent<'_>),
) -> PipelineRun {
    let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());
    let mut previous = initial;

    for (index, stage) in stages.iter().enumerate() {
        let name = stage.name();
        if ctx.cancel.is_paused() {
            info!(stage = name, "pipeline paused");
            emit(ctx, observer, StageEvent::Paused { stage: name });
        }
        if ctx.cancel.wait_while_paused() {
            info!(stage = name, "pipeline cancelled");
            emit(ctx, observer, StageEvent::Cancelled { stage: name });
            return PipelineRun::cancelled(results);
        }

        let input = match &stage.input {
            Some(mapper) => mapper(&previous, &results),
            None => previous.clone(),
        };
        emit(ctx, observer, StageEvent::Started { stage: name, index });
        let result = run_unit(stage.unit.as_ref(), &input, ctx);
        emit(
            ctx,
            observer,
            StageEvent::Finished {
                stage: name,
                result: &result,
            },
        );

        if result.status == UnitStatus::Error {
            let error = result.error.clone().unwrap_or_else(|| "unit failed".to_string());
            warn!(stage = name, err = %error, "stage failed, stopping pipeline");
            let error_kind = result.error_kind;
            results.push(StageResult {
                stage: name.to_string(),
                result,
            });
            return PipelineRun {
                status: PipelineStatus::Failed,
                results,
                error: Some(format!("stage '{name}': {error}")),
                error_kind,
            };
        }
        previous = result.data.clone();
        results.push(StageResult {
            stage: name.to_string(),
            result,
        });
    }

    debug!(stages = results.len(), "pipeline completed");
    PipelineRun::completed(results)
}

fn emit(ctx: &RunContext, observer: &mut dyn FnMut(&StageEvent<'_>), event: StageEvent<'_>) {
    event.record(ctx);
    observer(&event);
}
