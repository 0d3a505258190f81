//! Units of work: schema-validated steps with a uniform result envelope.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use jsonschema::Draft;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use super::context::RunContext;
use crate::agent::AgentError;
use crate::core::classifier::ErrorKind;
use crate::core::types::UnitStatus;

/// What a unit body returns on a normal exit.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitOutput {
    pub status: UnitStatus,
    pub data: Value,
    /// Overrides the measured wall time when set.
    pub duration_ms: Option<u64>,
}

impl UnitOutput {
    pub fn ok(data: Value) -> Self {
        Self {
            status: UnitStatus::Ok,
            data,
            duration_ms: None,
        }
    }

    pub fn skipped(data: Value) -> Self {
        Self {
            status: UnitStatus::Skipped,
            data,
            duration_ms: None,
        }
    }
}

/// Uniform envelope for every unit run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    pub status: UnitStatus,
    pub data: Value,
    pub error: Option<String>,
    /// Failure category when the error came from a worker invocation.
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl UnitResult {
    fn failure(error: String, error_kind: Option<ErrorKind>, started: Instant) -> Self {
        Self {
            status: UnitStatus::Error,
            data: Value::Null,
            error: Some(error),
            error_kind,
            duration_ms: elapsed_ms(started),
        }
    }
}

/// An atomic, independently testable pipeline step.
pub trait Unit {
    fn name(&self) -> &str;

    /// JSON Schema (Draft 2020-12) the raw input must satisfy.
    fn input_schema(&self) -> &Value;

    fn execute(&self, input: &Value, ctx: &RunContext) -> Result<UnitOutput>;
}

/// Validate `input`, run the unit body and wrap the outcome.
///
/// Never fails: validation and body errors become `status = error`.
pub fn run_unit(unit: &dyn Unit, input: &Value, ctx: &RunContext) -> UnitResult {
    let started = Instant::now();
    if let Err(err) = validate_input(unit.input_schema(), input) {
        warn!(unit = unit.name(), err = %format!("{err:#}"), "unit input rejected");
        return UnitResult::failure(format!("{err:#}"), None, started);
    }

    match unit.execute(input, ctx) {
        Ok(output) => {
            let duration_ms = output.duration_ms.unwrap_or_else(|| elapsed_ms(started));
            debug!(unit = unit.name(), status = ?output.status, duration_ms, "unit finished");
            UnitResult {
                status: output.status,
                data: output.data,
                error: None,
                error_kind: None,
                duration_ms,
            }
        }
        Err(err) => {
            let kind = err.downcast_ref::<AgentError>().map(AgentError::kind);
            warn!(unit = unit.name(), kind = ?kind, err = %format!("{err:#}"), "unit failed");
            UnitResult::failure(format!("{err:#}"), kind, started)
        }
    }
}

fn validate_input(schema: &Value, input: &Value) -> Result<()> {
    let compiled = jsonschema::options()
        .with_draft(Draft::Draft202012)
        .build(schema)
        .context("compile unit input schema")?;
    let messages: Vec<String> = compiled
        .iter_errors(input)
        .map(|err| err.to_string())
        .collect();
    if !messages.is_empty() {
        return Err(anyhow!("input validation failed: {}", messages.join("; ")));
    }
    Ok(())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Persisted unit outputs for one issue (`<scratch>/<issue-id>/<unit>.json`).
///
/// A unit whose output is already cached short-circuits instead of invoking
/// its worker again.
#[derive(Debug, Clone)]
pub struct ScratchCache {
    dir: PathBuf,
}

impl ScratchCache {
    pub fn new(scratch_dir: &Path, issue_id: &str) -> Self {
        Self {
            dir: scratch_dir.join(sanitize(issue_id)),
        }
    }

    pub fn path_for(&self, unit: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(unit)))
    }

    /// Cached output, if present and readable.
    pub fn load(&self, unit: &str) -> Option<Value> {
        let path = self.path_for(unit);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&contents) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(path = %path.display(), err = %err, "ignoring corrupt cached output");
                None
            }
        }
    }

    pub fn store(&self, unit: &str, value: &Value) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create scratch dir {}", self.dir.display()))?;
        let mut buf = serde_json::to_string_pretty(value)?;
        buf.push('\n');
        crate::io::write_atomic(&self.path_for(unit), &buf)
    }

    /// Drop every cached output for the issue.
    pub fn clear(&self) -> Result<()> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)
                .with_context(|| format!("remove scratch dir {}", self.dir.display()))?;
        }
        Ok(())
    }
}

/// Map an identifier to a safe single path component.
pub(crate) fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect()
}
