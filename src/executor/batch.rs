//! Batch step strategy.
//!
//! A batch step walks a list of work items in order. Items already processed
//! are skipped unless the run forces reprocessing, one item failing does not
//! stop the others, and the step succeeds only when no item failed.

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::process::CommandInvocation;
use super::{panic_message, StepContext, StepExecutor, StepFailure, StepResult};
use crate::state::{StepMetrics, StepOutputs};

/// Per-item logic behind a [`BatchStep`].
#[async_trait]
pub trait BatchItemHandler: Send + Sync {
    /// Lists the items to process.
    async fn items(&self, ctx: &StepContext) -> Result<Vec<String>, StepFailure>;

    /// Whether `item` was already processed by an earlier attempt.
    async fn is_processed(&self, _ctx: &StepContext, _item: &str) -> bool {
        false
    }

    /// Processes one item, returning the metrics it incurred.
    async fn process(&self, ctx: &StepContext, item: &str) -> anyhow::Result<StepMetrics>;
}

/// A step iterating over items produced by a [`BatchItemHandler`].
#[derive(Clone)]
pub struct BatchStep {
    handler: Arc<dyn BatchItemHandler>,
}

impl BatchStep {
    pub fn new(handler: impl BatchItemHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<dyn BatchItemHandler>) -> Self {
        Self { handler }
    }
}

impl std::fmt::Debug for BatchStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchStep").finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct BatchTally {
    completed: usize,
    failed: usize,
    skipped: usize,
    statuses: Map<String, Value>,
    errors: Map<String, Value>,
    metrics: StepMetrics,
}

impl BatchTally {
    fn mark(&mut self, item: &str, status: &str) {
        self.statuses
            .insert(item.to_string(), Value::String(status.to_string()));
    }

    fn into_outputs(self, total: usize) -> StepOutputs {
        let mut outputs = StepOutputs::new();
        outputs.insert("total".to_string(), Value::from(total));
        outputs.insert("completed".to_string(), Value::from(self.completed));
        outputs.insert("failed".to_string(), Value::from(self.failed));
        outputs.insert("skipped".to_string(), Value::from(self.skipped));
        outputs.insert("items".to_string(), Value::Object(self.statuses));
        if !self.errors.is_empty() {
            outputs.insert("errors".to_string(), Value::Object(self.errors));
        }
        outputs
    }
}

#[async_trait]
impl StepExecutor for BatchStep {
    fn strategy(&self) -> &'static str {
        "batch"
    }

    async fn execute(&self, ctx: &StepContext) -> StepResult {
        let items = match self.handler.items(ctx).await {
            Ok(items) => items,
            Err(failure) => return StepResult::failed(failure),
        };
        let total = items.len();
        let mut tally = BatchTally::default();

        info!(step = %ctx.step, items = total, force = ctx.force, "Starting batch");

        for (idx, item) in items.iter().enumerate() {
            if !ctx.force && self.handler.is_processed(ctx, item).await {
                debug!(step = %ctx.step, item = %item, "Item already processed, skipping");
                tally.skipped += 1;
                tally.mark(item, "skipped");
                continue;
            }

            info!(
                step = %ctx.step,
                item = %item,
                progress = format!("{}/{}", idx + 1, total),
                "Processing item"
            );

            let outcome = AssertUnwindSafe(self.handler.process(ctx, item))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(metrics)) => {
                    tally.metrics.accumulate(&metrics);
                    tally.completed += 1;
                    tally.mark(item, "completed");
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => format!("item panicked: {}", panic_message(payload.as_ref())),
            };

            warn!(step = %ctx.step, item = %item, error = %error, "Item failed");
            tally.failed += 1;
            tally.mark(item, "failed");
            tally.errors.insert(item.clone(), Value::String(error));
        }

        info!(
            step = %ctx.step,
            completed = tally.completed,
            failed = tally.failed,
            skipped = tally.skipped,
            "Batch finished"
        );

        let failed = tally.failed;
        let attempted = tally.completed + tally.failed;
        let metrics = std::mem::take(&mut tally.metrics);
        let result = StepResult::success(tally.into_outputs(total), metrics);

        if failed > 0 {
            StepResult {
                failure: Some(StepFailure::ExecutionFailed(format!(
                    "{} of {} items failed",
                    failed, attempted
                ))),
                ..result
            }
        } else {
            result
        }
    }
}

/// Runs one command per item, with items taken from a comma-separated run
/// parameter or identifier.
///
/// The command and the optional done marker are templates that may reference
/// `{item}`. An item whose marker path exists counts as already processed.
#[derive(Debug, Clone)]
pub struct CommandBatch {
    items_param: String,
    command: Vec<String>,
    working_dir: Option<String>,
    done_marker: Option<String>,
}

impl CommandBatch {
    pub fn new<I, S>(items_param: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items_param: items_param.into(),
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            done_marker: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Path template whose existence marks an item as processed.
    pub fn with_done_marker(mut self, marker: impl Into<String>) -> Self {
        self.done_marker = Some(marker.into());
        self
    }

    /// Wraps this handler in a [`BatchStep`].
    pub fn into_step(self) -> BatchStep {
        BatchStep::new(self)
    }
}

#[async_trait]
impl BatchItemHandler for CommandBatch {
    async fn items(&self, ctx: &StepContext) -> Result<Vec<String>, StepFailure> {
        let raw = ctx.require(&self.items_param)?;
        Ok(raw
            .split(',')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(str::to_string)
            .collect())
    }

    async fn is_processed(&self, ctx: &StepContext, item: &str) -> bool {
        let Some(marker) = &self.done_marker else {
            return false;
        };
        match ctx.render(marker, &[("item", item)]) {
            Ok(path) => tokio::fs::try_exists(PathBuf::from(path)).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn process(&self, ctx: &StepContext, item: &str) -> anyhow::Result<StepMetrics> {
        let invocation = CommandInvocation::render(
            ctx,
            &self.command,
            self.working_dir.as_deref(),
            &[],
            &[("item", item)],
        )?;
        let log_path = ctx.layout.step_output_log(&ctx.step);

        match invocation.run(ctx, &log_path, None).await? {
            0 => Ok(StepMetrics::default()),
            code => anyhow::bail!("exit code {}", code),
        }
    }
}
