//! In-process step strategy.
//!
//! Wraps a [`StepHandler`] supplied by the embedding application. Handler
//! errors and panics are caught, logged with the step's context, and turned
//! into failed results so a misbehaving step cannot take the orchestrator down.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use thiserror::Error;
use tracing::error;

use super::{panic_message, StepContext, StepExecutor, StepFailure, StepResult};
use crate::state::{StepMetrics, StepOutputs};

/// Successful output of a handler.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutput {
    pub outputs: StepOutputs,
    pub metrics: StepMetrics,
}

impl StepOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an output value.
    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn with_metrics(mut self, metrics: StepMetrics) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Errors a handler may return.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The step could not start.
    #[error("{0}")]
    Precondition(String),

    /// The step ran and failed.
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<StepFailure> for HandlerError {
    fn from(failure: StepFailure) -> Self {
        match failure {
            StepFailure::PreconditionFailed(msg) => HandlerError::Precondition(msg),
            StepFailure::ExecutionFailed(msg) => HandlerError::Failed(anyhow::anyhow!(msg)),
        }
    }
}

/// Application-provided step logic.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError>;
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler<F> {
    f: F,
}

/// Builds a handler from a closure taking an owned [`StepContext`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, HandlerError>> + Send,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutput, HandlerError>> + Send,
{
    async fn run(&self, ctx: &StepContext) -> Result<StepOutput, HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

/// A step that calls a [`StepHandler`] directly.
#[derive(Clone)]
pub struct InProcessStep {
    handler: Arc<dyn StepHandler>,
}

impl InProcessStep {
    pub fn new(handler: impl StepHandler + 'static) -> Self {
        Self {
            handler: Arc::new(handler),
        }
    }

    pub fn from_arc(handler: Arc<dyn StepHandler>) -> Self {
        Self { handler }
    }
}

impl std::fmt::Debug for InProcessStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessStep").finish_non_exhaustive()
    }
}

#[async_trait]
impl StepExecutor for InProcessStep {
    fn strategy(&self) -> &'static str {
        "in_process"
    }

    async fn execute(&self, ctx: &StepContext) -> StepResult {
        let outcome = AssertUnwindSafe(self.handler.run(ctx)).catch_unwind().await;

        match outcome {
            Ok(Ok(output)) => StepResult::success(output.outputs, output.metrics),
            Ok(Err(HandlerError::Precondition(msg))) => {
                error!(run_id = %ctx.run_id, step = %ctx.step, error = %msg, "Step could not start");
                StepResult::failed(StepFailure::PreconditionFailed(msg))
            }
            Ok(Err(HandlerError::Failed(e))) => {
                error!(
                    run_id = %ctx.run_id,
                    step = %ctx.step,
                    error = %format!("{:#}", e),
                    debug = ?e,
                    "Step handler failed"
                );
                StepResult::failed(StepFailure::ExecutionFailed(format!("{:#}", e)))
            }
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                error!(run_id = %ctx.run_id, step = %ctx.step, panic = %msg, "Step handler panicked");
                StepResult::failed(StepFailure::ExecutionFailed(format!(
                    "step panicked: {}",
                    msg
                )))
            }
        }
    }
}
