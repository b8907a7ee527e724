//! Per-run observability sink.
//!
//! Lifecycle hooks called by the orchestrator. Each hook logs, appends an
//! event to `reports/events.jsonl`, and keeps an in-memory aggregate that is
//! flushed to `reports/summary.json`, `reports/metrics.json` and
//! `reports/metrics.prom` when the attempt ends.
//!
//! Every write here is best-effort: failures are logged at `warn` and
//! swallowed, so observability problems never fail a run.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use super::events::{EventLog, PipelineEvent};
use super::logging::LogRouter;
use super::prometheus;
use crate::executor::StepResult;
use crate::state::store::write_atomic;
use crate::state::types::seconds_between;
use crate::state::{RunLayout, RunState};

/// Totals for the current attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AttemptTotals {
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub steps_completed: usize,
    pub steps_failed: usize,
    pub steps_skipped: usize,
}

/// Observer for one run attempt.
#[derive(Debug)]
pub struct ObservabilitySink {
    run_id: String,
    pipeline_kind: String,
    layout: RunLayout,
    events: EventLog,
    router: Option<LogRouter>,
    attempt_started: DateTime<Utc>,
    step_started: HashMap<String, DateTime<Utc>>,
    totals: AttemptTotals,
}

impl ObservabilitySink {
    pub fn new(run_id: impl Into<String>, pipeline_kind: impl Into<String>, layout: RunLayout) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_kind: pipeline_kind.into(),
            events: EventLog::new(layout.events()),
            layout,
            router: None,
            attempt_started: Utc::now(),
            step_started: HashMap::new(),
            totals: AttemptTotals::default(),
        }
    }

    /// Routes this run's log events to its log files while the sink lives.
    pub fn with_router(mut self, router: LogRouter) -> Self {
        self.router = Some(router);
        self
    }

    pub fn totals(&self) -> &AttemptTotals {
        &self.totals
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub async fn run_started(&mut self, state: &RunState) {
        self.attempt_started = Utc::now();

        if let Some(router) = &self.router {
            if let Err(e) = router.attach(&self.run_id, &self.layout) {
                warn!(run_id = %self.run_id, error = %e, "Failed to open run log files");
            }
        }
        if let Err(e) = prometheus::init_metrics() {
            warn!(error = %e, "Failed to initialize metrics");
        }

        let resumed = !state.steps.is_empty();
        info!(
            run_id = %self.run_id,
            pipeline = %self.pipeline_kind,
            resumed = resumed,
            next_step = ?state.next_step,
            "Run started"
        );

        self.emit_event(
            "run_started",
            json!({
                "pipeline_kind": self.pipeline_kind,
                "parameters": state.parameters,
                "resumed": resumed,
                "last_completed_step": state.last_completed_step,
            }),
        )
        .await;
    }

    pub async fn step_started(&mut self, name: &str) {
        self.step_started.insert(name.to_string(), Utc::now());
        info!(step = %name, "Step started");
        self.emit_event("step_started", json!({ "step": name })).await;
    }

    /// Records a finished step and writes `reports/steps/<name>.json`.
    pub async fn step_completed(&mut self, name: &str, result: &StepResult, success: bool) {
        let completed_at = Utc::now();
        let started_at = self.step_started.remove(name).unwrap_or(completed_at);
        let duration = seconds_between(started_at, completed_at);

        self.totals.cost += result.metrics.cost();
        self.totals.input_tokens = self
            .totals
            .input_tokens
            .saturating_add(result.metrics.input_tokens());
        self.totals.output_tokens = self
            .totals
            .output_tokens
            .saturating_add(result.metrics.output_tokens());

        let status = if success {
            self.totals.steps_completed += 1;
            "completed"
        } else {
            self.totals.steps_failed += 1;
            "failed"
        };

        prometheus::record_step(
            &self.pipeline_kind,
            name,
            status,
            duration,
            result.metrics.cost(),
            (result.metrics.input_tokens(), result.metrics.output_tokens()),
        );

        if success {
            info!(
                step = %name,
                duration_secs = duration,
                cost = result.metrics.cost(),
                tokens = result.metrics.total_tokens(),
                "Step completed"
            );
        } else {
            error!(
                step = %name,
                duration_secs = duration,
                error = result.error().unwrap_or("unknown error"),
                "Step failed"
            );
        }

        let report = json!({
            "run_id": self.run_id,
            "step": name,
            "status": status,
            "started_at": started_at,
            "completed_at": completed_at,
            "duration_seconds": duration,
            "result": result.to_json(),
        });
        self.write_json(&self.layout.step_report(name), &report).await;

        self.emit_event(
            "step_completed",
            json!({
                "step": name,
                "success": success,
                "duration_seconds": duration,
                "cost": result.metrics.cost(),
                "tokens": result.metrics.total_tokens(),
                "error": result.error(),
            }),
        )
        .await;
    }

    pub async fn step_skipped(&mut self, name: &str, reason: &str) {
        self.totals.steps_skipped += 1;
        prometheus::record_step(&self.pipeline_kind, name, "skipped", 0.0, 0.0, (0, 0));
        info!(step = %name, reason = %reason, "Step skipped");
        self.emit_event("step_skipped", json!({ "step": name, "reason": reason }))
            .await;
    }

    pub async fn run_completed(&mut self, state: &RunState, success: bool) {
        let status = if success { "completed" } else { "failed" };
        prometheus::record_run(&self.pipeline_kind, status);

        info!(
            run_id = %self.run_id,
            status = status,
            total_cost = state.total_cost,
            total_tokens = state.total_tokens,
            "Run finished"
        );

        self.flush_reports(state).await;
        self.emit_event(
            "run_completed",
            json!({
                "success": success,
                "total_cost": state.total_cost,
                "total_tokens": state.total_tokens,
            }),
        )
        .await;
    }

    pub async fn run_failed(&mut self, state: &RunState, step: Option<&str>, message: &str) {
        prometheus::record_run(&self.pipeline_kind, "failed");

        error!(
            run_id = %self.run_id,
            step = ?step,
            error = %message,
            "Run failed"
        );

        self.flush_reports(state).await;
        self.emit_event(
            "run_failed",
            json!({
                "step": step,
                "error": message,
                "next_step": state.next_step,
            }),
        )
        .await;
    }

    /// Appends one event to the run's event stream.
    pub async fn emit_event(&self, event_type: &str, data: Value) {
        let event = PipelineEvent::new(event_type, &self.run_id).with_fields(data);
        if let Err(e) = self.events.append(&event).await {
            warn!(
                run_id = %self.run_id,
                event = %event_type,
                error = %e,
                "Failed to append event"
            );
        }
    }

    async fn flush_reports(&self, state: &RunState) {
        let summary = self.summary_document(state);
        self.write_json(&self.layout.summary(), &summary).await;

        let metrics = self.metrics_document(state);
        self.write_json(&self.layout.metrics(), &metrics).await;

        let exposition = prometheus::export_metrics();
        if let Err(e) = write_atomic(&self.layout.prometheus(), exposition.as_bytes()).await {
            warn!(run_id = %self.run_id, error = %e, "Failed to write metrics.prom");
        }
    }

    fn summary_document(&self, state: &RunState) -> Value {
        let finished_at = Utc::now();
        json!({
            "run_id": state.run_id,
            "pipeline_kind": state.pipeline_kind,
            "status": state.status,
            "parameters": state.parameters,
            "identifiers": state.identifiers,
            "started_at": state.started_at,
            "updated_at": state.updated_at,
            "attempt_started_at": self.attempt_started,
            "attempt_duration_seconds": seconds_between(self.attempt_started, finished_at),
            "last_completed_step": state.last_completed_step,
            "next_step": state.next_step,
            "steps_completed": state.completed_count(),
            "total_cost": state.total_cost,
            "total_tokens": state.total_tokens,
            "total_input_tokens": state.total_input_tokens,
            "total_output_tokens": state.total_output_tokens,
            "error": state.error,
            "paths": {
                "checkpoint": self.layout.checkpoint(),
                "reports": self.layout.reports_dir(),
                "logs": self.layout.logs_dir(),
            },
        })
    }

    fn metrics_document(&self, state: &RunState) -> Value {
        let steps: BTreeMap<&str, Value> = state
            .steps
            .values()
            .map(|record| {
                (
                    record.name.as_str(),
                    json!({
                        "status": record.status,
                        "duration_seconds": record.effective_duration(),
                        "metrics": record.metrics,
                    }),
                )
            })
            .collect();

        json!({
            "run_id": state.run_id,
            "pipeline_kind": state.pipeline_kind,
            "totals": {
                "cost": state.total_cost,
                "tokens": state.total_tokens,
                "input_tokens": state.total_input_tokens,
                "output_tokens": state.total_output_tokens,
            },
            "attempt": self.totals,
            "steps": steps,
        })
    }

    async fn write_json(&self, path: &Path, value: &Value) {
        let bytes = match serde_json::to_vec_pretty(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to serialize report");
                return;
            }
        };
        if let Err(e) = write_atomic(path, &bytes).await {
            warn!(path = %path.display(), error = %e, "Failed to write report");
        }
    }
}

impl Drop for ObservabilitySink {
    fn drop(&mut self) {
        if let Some(router) = &self.router {
            router.detach(&self.run_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StepFailure;
    use crate::state::{StepMetrics, StepOutputs};
    use std::collections::BTreeMap as Map;
    use tempfile::TempDir;

    fn state() -> RunState {
        RunState::new("r1", "course", Map::new())
    }

    #[tokio::test]
    async fn test_lifecycle_writes_reports_and_events() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let layout = RunLayout::new(temp_dir.path());
        let mut sink = ObservabilitySink::new("r1", "course", layout.clone());
        let mut state = state();

        sink.run_started(&state).await;
        sink.step_started("outline").await;
        let ok = StepResult::success(
            StepOutputs::new(),
            StepMetrics::new().with_cost(0.5).with_tokens(100, 20),
        );
        sink.step_completed("outline", &ok, true).await;
        sink.step_skipped("review", "requested").await;
        sink.step_started("lessons").await;
        let failed = StepResult::failed(StepFailure::ExecutionFailed("boom".to_string()));
        sink.step_completed("lessons", &failed, false).await;

        state.mark_failed("boom");
        sink.run_failed(&state, Some("lessons"), "boom").await;

        assert_eq!(sink.totals().steps_completed, 1);
        assert_eq!(sink.totals().steps_failed, 1);
        assert_eq!(sink.totals().steps_skipped, 1);
        assert_eq!(sink.totals().input_tokens, 100);

        let report: Value =
            serde_json::from_str(&std::fs::read_to_string(layout.step_report("outline")).expect("report"))
                .expect("json");
        assert_eq!(report["status"], json!("completed"));
        assert_eq!(report["result"]["metrics"]["cost"], json!(0.5));

        let summary: Value =
            serde_json::from_str(&std::fs::read_to_string(layout.summary()).expect("summary"))
                .expect("json");
        assert_eq!(summary["status"], json!("failed"));
        assert_eq!(summary["error"], json!("boom"));
        assert!(layout.metrics().exists());
        assert!(layout.prometheus().exists());

        let events = EventLog::new(layout.events()).read_all().await.expect("events");
        let kinds: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(
            kinds,
            vec![
                "run_started",
                "step_started",
                "step_completed",
                "step_skipped",
                "step_started",
                "step_completed",
                "run_failed"
            ]
        );
        assert!(events.iter().all(|e| e.run_id == "r1"));
    }

    #[tokio::test]
    async fn test_unwritable_location_does_not_panic() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").expect("write");

        // Every path under a regular file is unwritable.
        let mut sink = ObservabilitySink::new("r1", "course", RunLayout::new(&blocker))
            .with_router(LogRouter::new());
        let state = state();

        sink.run_started(&state).await;
        sink.step_started("outline").await;
        sink.step_completed("outline", &StepResult::default(), true).await;
        sink.run_completed(&state, true).await;

        assert!(!blocker.join("reports").exists());
    }
}
