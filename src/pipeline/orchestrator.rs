//! Checkpointed pipeline orchestrator.
//!
//! Drives one run of a pipeline kind through its fixed step sequence:
//! - Creates a new run or loads the checkpoint of a run being resumed
//! - Starts from the step after `last_completed_step`
//! - Waits for the dependency gate before gated steps
//! - Persists every step record before the next step begins
//! - Records failures in the checkpoint so the run can be resumed later

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, info_span, warn, Instrument};

use super::config::OrchestratorConfig;
use super::definition::{PipelineDefinition, PipelineRegistry, StepDefinition};
use crate::error::{OrchestratorError, StateError};
use crate::executor::{panic_message, StepContext, StepFailure, StepResult};
use crate::observability::{LogRouter, ObservabilitySink, RUN_SPAN, STEP_SPAN};
use crate::state::types::seconds_between;
use crate::state::{generate_run_id, RunLayout, RunState, RunStatus, StateStore, StepRecord, StepStatus};

/// Reason recorded for steps skipped with `--skip`.
const SKIP_REQUESTED: &str = "skipped on request";
/// Reason reported for steps already done in an earlier attempt.
const ALREADY_DONE: &str = "already completed";

/// Parameters of a single run attempt.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub pipeline_kind: String,
    /// Parameters for a new run. Ignored when resuming.
    pub parameters: BTreeMap<String, String>,
    /// Resume this run instead of starting a new one.
    pub resume: Option<String>,
    /// Id for a new run. Generated when absent.
    pub run_id: Option<String>,
    /// Simulate every step without invoking executors.
    pub dry_run: bool,
    /// Steps to mark skipped without running them.
    pub skip: Vec<String>,
    /// Re-execute steps that already completed.
    pub force: bool,
    /// Overrides the configured dependency wait.
    pub dependency_timeout: Option<Duration>,
}

impl RunRequest {
    pub fn new(pipeline_kind: impl Into<String>) -> Self {
        Self {
            pipeline_kind: pipeline_kind.into(),
            ..Self::default()
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, parameters: BTreeMap<String, String>) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn resume(mut self, run_id: impl Into<String>) -> Self {
        self.resume = Some(run_id.into());
        self
    }

    /// Starts the new run under `run_id`, so the caller can find its
    /// checkpoint even when the attempt returns an error.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn skip(mut self, step: impl Into<String>) -> Self {
        self.skip.push(step.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_dependency_timeout(mut self, timeout: Duration) -> Self {
        self.dependency_timeout = Some(timeout);
        self
    }
}

/// What happened during one run attempt.
#[derive(Debug)]
pub struct RunOutcome {
    /// Checkpoint as persisted at the end of the attempt.
    pub state: RunState,
    pub layout: RunLayout,
    /// Steps whose executor ran in this attempt, in order.
    pub executed: Vec<String>,
    /// Steps reported as skipped in this attempt.
    pub skipped: Vec<String>,
    /// Why the run stopped, when it did not complete.
    pub failure: Option<OrchestratorError>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.failure.is_none() && self.state.status == RunStatus::Completed
    }

    /// Converts a stopped run into its error.
    pub fn into_result(self) -> Result<RunState, OrchestratorError> {
        match self.failure {
            Some(err) => Err(err),
            None => Ok(self.state),
        }
    }
}

/// Runs pipelines registered in a [`PipelineRegistry`] against a
/// [`StateStore`].
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: PipelineRegistry,
    store: StateStore,
    log_router: Option<LogRouter>,
}

impl Orchestrator {
    /// Creates an orchestrator storing runs under `config.output_dir`.
    pub fn new(config: OrchestratorConfig, registry: PipelineRegistry) -> Self {
        let store = StateStore::new(&config.output_dir);
        Self {
            config,
            registry,
            store,
            log_router: None,
        }
    }

    /// Writes each run's events to its log files through `router`.
    pub fn with_log_router(mut self, router: LogRouter) -> Self {
        self.log_router = Some(router);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Starts or resumes a run.
    ///
    /// Returns `Ok` once the attempt is over and its checkpoint persisted,
    /// including when a step failed or the dependency never became healthy;
    /// those are reported in [`RunOutcome::failure`] and can be resumed.
    ///
    /// # Errors
    ///
    /// - `UnknownPipeline`, `Validation`, `MissingPrerequisite`: nothing was
    ///   written
    /// - `UnknownRun`: the run to resume has no checkpoint
    /// - `State(CorruptState)`: the checkpoint to resume cannot be parsed
    /// - `State`, `Unexpected`: the attempt broke down; the checkpoint was
    ///   marked failed on a best-effort basis
    pub async fn run(&self, request: RunRequest) -> Result<RunOutcome, OrchestratorError> {
        let pipeline = self
            .registry
            .get(&request.pipeline_kind)
            .ok_or_else(|| OrchestratorError::UnknownPipeline(request.pipeline_kind.clone()))?;

        self.validate_request(pipeline, &request)?;

        let mut state = self.load_state(pipeline, &request).await?;
        let names = pipeline.step_names();

        let start = if request.force {
            0
        } else {
            state.resume_index(&names)
        };
        check_skip_prerequisites(pipeline, &state, &request.skip, start)?;

        let layout = self.store.layout(&state.run_id);
        let mut sink = ObservabilitySink::new(&state.run_id, &pipeline.kind, layout.clone());
        if let Some(router) = &self.log_router {
            sink = sink.with_router(router.clone());
        }

        let span = info_span!(
            RUN_SPAN,
            run_id = %state.run_id,
            pipeline = %pipeline.kind,
            dry_run = request.dry_run
        );

        let mut progress = Progress::default();
        let failure = async {
            let attempt = AssertUnwindSafe(self.execute_steps(
                pipeline,
                &request,
                start,
                &mut state,
                &mut sink,
                &mut progress,
            ))
            .catch_unwind()
            .await;

            let err = match attempt {
                Ok(Ok(())) => return None,
                Ok(Err(err)) => err,
                Err(payload) => OrchestratorError::Unexpected(format!(
                    "orchestrator panicked: {}",
                    panic_message(payload.as_ref())
                )),
            };

            self.record_failure(&mut state, &mut sink, &progress, &err).await;
            Some(err)
        }
        .instrument(span)
        .await;

        let outcome = RunOutcome {
            state,
            layout,
            executed: progress.executed,
            skipped: progress.skipped,
            failure: None,
        };

        match failure {
            None => Ok(outcome),
            Some(err) if err.is_resumable() => Ok(RunOutcome {
                failure: Some(err),
                ..outcome
            }),
            Some(err) => Err(err),
        }
    }

    fn validate_request(
        &self,
        pipeline: &PipelineDefinition,
        request: &RunRequest,
    ) -> Result<(), OrchestratorError> {
        for name in &request.skip {
            if pipeline.step(name).is_none() {
                return Err(OrchestratorError::Validation(format!(
                    "cannot skip unknown step '{}' (pipeline '{}' has: {})",
                    name,
                    pipeline.kind,
                    pipeline.step_names().join(", ")
                )));
            }
        }

        // Simulated records would overwrite the real ones in the checkpoint.
        if request.dry_run {
            if let Some(run_id) = &request.resume {
                return Err(OrchestratorError::Validation(format!(
                    "--dry-run cannot be combined with --resume (run '{}'); \
                     start a new dry run instead",
                    run_id
                )));
            }
        }

        if !request.dry_run && pipeline.requires_dependency() && self.registry.dependency().is_none()
        {
            return Err(OrchestratorError::Validation(format!(
                "pipeline '{}' has gated steps but no dependency is configured",
                pipeline.kind
            )));
        }

        if request.dependency_timeout == Some(Duration::ZERO) {
            return Err(OrchestratorError::Validation(
                "dependency timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    async fn load_state(
        &self,
        pipeline: &PipelineDefinition,
        request: &RunRequest,
    ) -> Result<RunState, OrchestratorError> {
        let Some(run_id) = &request.resume else {
            pipeline.check_parameters(&request.parameters)?;
            let run_id = match &request.run_id {
                Some(run_id) if self.store.exists(run_id) => {
                    return Err(OrchestratorError::Validation(format!(
                        "run '{}' already exists; use --resume to continue it",
                        run_id
                    )))
                }
                Some(run_id) => run_id.clone(),
                None => generate_run_id(),
            };
            return Ok(self
                .store
                .load_or_create(&run_id, &pipeline.kind, Some(request.parameters.clone()))
                .await?);
        };

        let state = match self.store.load(run_id).await {
            Ok(state) => state,
            Err(StateError::NotFound(_)) | Err(StateError::InvalidRunId(_)) => {
                return Err(OrchestratorError::UnknownRun(run_id.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        if state.pipeline_kind != pipeline.kind {
            return Err(OrchestratorError::Validation(format!(
                "run '{}' belongs to pipeline '{}', not '{}'",
                run_id, state.pipeline_kind, pipeline.kind
            )));
        }
        if !request.parameters.is_empty() {
            debug!(run_id = %run_id, "Ignoring parameters supplied for a resumed run");
        }

        info!(
            run_id = %run_id,
            status = %state.status,
            last_completed_step = ?state.last_completed_step,
            "Resuming run"
        );
        Ok(state)
    }

    async fn execute_steps(
        &self,
        pipeline: &PipelineDefinition,
        request: &RunRequest,
        start: usize,
        state: &mut RunState,
        sink: &mut ObservabilitySink,
        progress: &mut Progress,
    ) -> Result<(), OrchestratorError> {
        let names = pipeline.step_names();

        state.mark_in_progress();
        state.recompute_pointers(&names);
        self.store.save(state).await?;
        sink.run_started(state).await;

        for (idx, step) in pipeline.steps().iter().enumerate() {
            if idx < start {
                sink.step_skipped(&step.name, ALREADY_DONE).await;
                progress.skipped.push(step.name.clone());
                continue;
            }

            if request.skip.contains(&step.name) {
                if !state.step_status(&step.name).is_done() {
                    let record = StepRecord::skipped(&step.name, SKIP_REQUESTED);
                    for key in &step.produces {
                        if let Some(value) = state.lookup(key).map(str::to_string) {
                            state.identifiers.insert(key.clone(), value);
                        }
                    }
                    state.record_step(record, &names);
                    self.store.save(state).await?;
                }
                sink.step_skipped(&step.name, SKIP_REQUESTED).await;
                progress.skipped.push(step.name.clone());
                continue;
            }

            progress.current = Some(step.name.clone());
            let step_span = info_span!(STEP_SPAN, step = %step.name);
            self.execute_step(pipeline, step, request, state, sink)
                .instrument(step_span)
                .await?;
            progress.executed.push(step.name.clone());
            progress.current = None;
        }

        state.mark_completed();
        state.recompute_pointers(&names);
        self.store.save(state).await?;
        sink.run_completed(state, true).await;

        Ok(())
    }

    async fn execute_step(
        &self,
        pipeline: &PipelineDefinition,
        step: &StepDefinition,
        request: &RunRequest,
        state: &mut RunState,
        sink: &mut ObservabilitySink,
    ) -> Result<(), OrchestratorError> {
        let names = pipeline.step_names();
        sink.step_started(&step.name).await;

        if step.requires_dependency && !request.dry_run {
            self.wait_for_dependency(step, request).await?;
        }

        let started_at = Utc::now();
        let mut in_progress = StepRecord::pending(&step.name);
        in_progress.status = StepStatus::InProgress;
        in_progress.started_at = Some(started_at);
        state.record_step(in_progress, &names);
        self.store.save(state).await?;

        let ctx = StepContext {
            run_id: state.run_id.clone(),
            pipeline_kind: pipeline.kind.clone(),
            step: step.name.clone(),
            parameters: state.parameters.clone(),
            identifiers: state.identifiers.clone(),
            layout: self.store.layout(&state.run_id),
            force: request.force,
        };

        let result = if let Some(key) = step.requires.iter().find(|key| ctx.lookup(key).is_none()) {
            StepResult::failed(StepFailure::PreconditionFailed(format!(
                "required input '{}' is neither a run parameter nor a produced identifier",
                key
            )))
        } else if request.dry_run {
            StepResult::simulated(&step.name, &step.produces)
        } else {
            debug!(strategy = step.executor().strategy(), "Invoking executor");
            step.executor().execute(&ctx).await
        };
        let completed_at = Utc::now();
        let success = result.is_success();

        if success {
            capture_identifiers(step, &result, state);
        }

        let record = StepRecord {
            name: step.name.clone(),
            status: if success {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            },
            started_at: Some(started_at),
            completed_at: Some(completed_at),
            duration_seconds: Some(seconds_between(started_at, completed_at)),
            outputs: result.outputs.clone(),
            metrics: result.metrics.clone(),
            error: result.error().map(str::to_string),
            failure_kind: result.failure.as_ref().map(StepFailure::kind),
        };
        state.record_step(record, &names);
        self.store.save(state).await?;

        if let Err(e) = self
            .store
            .save_step_artifact(&state.run_id, &step.name, &result.to_json())
            .await
        {
            warn!(step = %step.name, error = %e, "Failed to save step artifact");
        }

        sink.step_completed(&step.name, &result, success).await;

        match result.failure {
            None => Ok(()),
            Some(failure) => Err(OrchestratorError::StepFailed {
                step: step.name.clone(),
                error: failure.message().to_string(),
            }),
        }
    }

    async fn wait_for_dependency(
        &self,
        step: &StepDefinition,
        request: &RunRequest,
    ) -> Result<(), OrchestratorError> {
        let Some(gate) = self.registry.dependency() else {
            return Err(OrchestratorError::Validation(format!(
                "step '{}' requires a dependency but none is configured",
                step.name
            )));
        };

        let timeout = request
            .dependency_timeout
            .unwrap_or(self.config.dependency_timeout);

        if gate.wait_for_health(timeout, self.config.poll_interval).await {
            return Ok(());
        }

        Err(OrchestratorError::DependencyUnavailable {
            step: step.name.clone(),
            dependency: gate.name().to_string(),
            message: format!(
                "{} did not become healthy within {}s",
                gate.health_url(),
                timeout.as_secs_f64()
            ),
            remediation: gate.remediation().to_string(),
        })
    }

    /// Marks the run failed, persists it, and reports it. Persistence errors
    /// are logged; the original error is what the caller sees.
    async fn record_failure(
        &self,
        state: &mut RunState,
        sink: &mut ObservabilitySink,
        progress: &Progress,
        err: &OrchestratorError,
    ) {
        let (step, message) = match err {
            OrchestratorError::StepFailed { step, error } => (Some(step.clone()), error.clone()),
            OrchestratorError::DependencyUnavailable { step, .. } => {
                (Some(step.clone()), err.to_string())
            }
            other => (progress.current.clone(), other.to_string()),
        };

        state.mark_failed(&message);
        if let OrchestratorError::DependencyUnavailable { step, .. } = err {
            // The gated step never ran; resume must retry it.
            state.next_step = Some(step.clone());
        }

        if let Err(e) = self.store.save(state).await {
            tracing::error!(run_id = %state.run_id, error = %e, "Failed to persist failed run state");
        }
        sink.run_failed(state, step.as_deref(), &message).await;
    }
}

/// Bookkeeping for the current attempt.
#[derive(Debug, Default)]
struct Progress {
    executed: Vec<String>,
    skipped: Vec<String>,
    current: Option<String>,
}

/// Fails fast when a step that will be skipped produces a key nothing else
/// supplies.
///
/// Walks the steps from `start`: keys produced by steps that will run are
/// assumed available to later steps, while steps being skipped must find
/// each of their keys among the run's identifiers, its parameters, or an
/// earlier step's outputs.
fn check_skip_prerequisites(
    pipeline: &PipelineDefinition,
    state: &RunState,
    skip: &[String],
    start: usize,
) -> Result<(), OrchestratorError> {
    let mut available: Vec<&str> = Vec::new();

    for step in pipeline.steps().iter().skip(start) {
        let skipped = skip.contains(&step.name);
        if skipped && !state.step_status(&step.name).is_done() {
            for key in &step.produces {
                if state.lookup(key).is_none() && !available.contains(&key.as_str()) {
                    return Err(OrchestratorError::MissingPrerequisite {
                        step: step.name.clone(),
                        key: key.clone(),
                    });
                }
            }
        } else if !skipped {
            available.extend(step.produces.iter().map(String::as_str));
        }
    }

    Ok(())
}

/// Copies declared outputs of a successful step into the run's identifiers.
fn capture_identifiers(step: &StepDefinition, result: &StepResult, state: &mut RunState) {
    for key in &step.produces {
        match result.outputs.get(key) {
            Some(Value::String(value)) => {
                state.identifiers.insert(key.clone(), value.clone());
            }
            Some(Value::Null) | None => {
                warn!(step = %step.name, key = %key, "Step did not produce declared output");
            }
            Some(other) => {
                state.identifiers.insert(key.clone(), other.to_string());
            }
        }
    }
}
