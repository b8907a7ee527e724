//! Step execution strategies.
//!
//! Every step is a black box behind the [`StepExecutor`] trait: it receives a
//! [`StepContext`] and returns a normalized [`StepResult`]. Executors never
//! return errors or panic into the orchestrator; a step that could not start
//! and a step that ran and failed are both reported as values, kept apart by
//! [`StepFailure`].
//!
//! # Strategies
//!
//! - [`ProcessStep`]: runs an external command, capturing its combined output
//!   to a per-step log file
//! - [`InProcessStep`]: calls an injected [`StepHandler`]
//! - [`BatchStep`]: iterates items with per-item skip and partial-failure
//!   tracking, driven by a [`BatchItemHandler`] (for example [`CommandBatch`])

pub mod batch;
pub mod in_process;
pub mod process;

use std::any::Any;
use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::state::{FailureKind, RunLayout, StepMetrics, StepOutputs};

pub use batch::{BatchItemHandler, BatchStep, CommandBatch};
pub use in_process::{handler_fn, FnHandler, HandlerError, InProcessStep, StepHandler, StepOutput};
pub use process::ProcessStep;

/// Why a step did not succeed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepFailure {
    /// The step could not start (missing input, unknown placeholder, spawn failure).
    PreconditionFailed(String),
    /// The step ran and reported failure.
    ExecutionFailed(String),
}

impl StepFailure {
    pub fn message(&self) -> &str {
        match self {
            StepFailure::PreconditionFailed(msg) | StepFailure::ExecutionFailed(msg) => msg,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepFailure::PreconditionFailed(_) => FailureKind::PreconditionFailed,
            StepFailure::ExecutionFailed(_) => FailureKind::ExecutionFailed,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message())
    }
}

impl std::error::Error for StepFailure {}

/// Normalized outcome of one step execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepResult {
    pub outputs: StepOutputs,
    pub metrics: StepMetrics,
    pub failure: Option<StepFailure>,
}

impl StepResult {
    /// A successful result.
    pub fn success(outputs: StepOutputs, metrics: StepMetrics) -> Self {
        Self {
            outputs,
            metrics,
            failure: None,
        }
    }

    /// A failed result with no outputs.
    pub fn failed(failure: StepFailure) -> Self {
        Self {
            failure: Some(failure),
            ..Self::default()
        }
    }

    /// Result used by dry runs: success, with placeholders for every
    /// identifier the step would have produced.
    pub fn simulated(step: &str, produces: &[String]) -> Self {
        let mut outputs = StepOutputs::new();
        outputs.insert("dry_run".to_string(), Value::Bool(true));
        for key in produces {
            outputs.insert(key.clone(), Value::String(format!("dry-run-{}-{}", step, key)));
        }
        Self::success(outputs, StepMetrics::default())
    }

    pub fn with_outputs(mut self, outputs: StepOutputs) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    /// Error message, present iff the step failed.
    pub fn error(&self) -> Option<&str> {
        self.failure.as_ref().map(StepFailure::message)
    }

    /// JSON document stored as the step's detailed artifact.
    pub fn to_json(&self) -> Value {
        json!({
            "success": self.is_success(),
            "outputs": self.outputs,
            "metrics": self.metrics,
            "error": self.error(),
            "failure_kind": self.failure.as_ref().map(StepFailure::kind),
        })
    }
}

/// Everything a step may read about the run it belongs to.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: String,
    pub pipeline_kind: String,
    pub step: String,
    pub parameters: BTreeMap<String, String>,
    /// Identifiers produced by earlier steps.
    pub identifiers: BTreeMap<String, String>,
    pub layout: RunLayout,
    /// Reprocess work even when it looks already done.
    pub force: bool,
}

impl StepContext {
    /// Looks up a key in produced identifiers, then in run parameters.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.identifiers
            .get(key)
            .or_else(|| self.parameters.get(key))
            .map(String::as_str)
    }

    /// Like [`lookup`](Self::lookup), but a missing key is a precondition failure.
    pub fn require(&self, key: &str) -> Result<&str, StepFailure> {
        self.lookup(key).ok_or_else(|| {
            StepFailure::PreconditionFailed(format!(
                "required value '{}' is neither a run parameter nor a produced identifier",
                key
            ))
        })
    }

    /// Substitutes `{name}` placeholders in `template`.
    ///
    /// Names resolve against `extra`, then the built-ins `run_id`, `run_dir`
    /// and `step`, then [`lookup`](Self::lookup). Braces around anything that
    /// is not a plain name are left untouched.
    pub fn render(&self, template: &str, extra: &[(&str, &str)]) -> Result<String, StepFailure> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            let Some(close) = after.find('}') else {
                out.push_str(&rest[open..]);
                return Ok(out);
            };
            let name = &after[..close];

            if name.is_empty() || !name.chars().all(is_placeholder_char) {
                out.push('{');
                rest = after;
                continue;
            }

            let value = self.resolve(name, extra).ok_or_else(|| {
                StepFailure::PreconditionFailed(format!(
                    "unknown placeholder '{{{}}}' in '{}'",
                    name, template
                ))
            })?;
            out.push_str(&value);
            rest = &after[close + 1..];
        }

        out.push_str(rest);
        Ok(out)
    }

    fn resolve(&self, name: &str, extra: &[(&str, &str)]) -> Option<String> {
        if let Some((_, value)) = extra.iter().find(|(key, _)| *key == name) {
            return Some((*value).to_string());
        }
        match name {
            "run_id" => Some(self.run_id.clone()),
            "run_dir" => Some(self.layout.root().display().to_string()),
            "step" => Some(self.step.clone()),
            _ => self.lookup(name).map(str::to_string),
        }
    }
}

fn is_placeholder_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Uniform contract over all execution strategies.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Short strategy name, recorded in logs and events.
    fn strategy(&self) -> &'static str;

    /// Runs the step. Must not panic; failures are reported in the result.
    async fn execute(&self, ctx: &StepContext) -> StepResult;
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "step panicked".to_string()
    }
}
