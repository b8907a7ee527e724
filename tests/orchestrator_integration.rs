//! End-to-end tests for the orchestrator: checkpoints, resume, skip, dry runs,
//! the dependency gate and the per-run files.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing_subscriber::prelude::*;

use stepforge::error::{OrchestratorError, StateError};
use stepforge::executor::{
    handler_fn, CommandBatch, HandlerError, InProcessStep, ProcessStep, StepContext,
    StepExecutor, StepOutput, StepResult,
};
use stepforge::gate::{DependencyGate, DEFAULT_HEALTH_PATH};
use stepforge::observability::{EventLog, LogRouter, RunLogLayer};
use stepforge::pipeline::{
    Orchestrator, OrchestratorConfig, PipelineDefinition, PipelineRegistry, RunRequest,
    StepDefinition,
};
use stepforge::state::{RunState, RunStatus, StateStore, StepMetrics, StepStatus};

type Calls = Arc<Mutex<Vec<String>>>;

/// In-process step that records its invocation and charges `cost`.
fn recording_step(name: &str, calls: &Calls, cost: f64) -> StepDefinition {
    let calls = calls.clone();
    let step = name.to_string();
    StepDefinition::new(
        name,
        InProcessStep::new(handler_fn(move |_ctx: StepContext| {
            let calls = calls.clone();
            let step = step.clone();
            async move {
                calls.lock().expect("lock").push(step);
                Ok::<_, HandlerError>(
                    StepOutput::new().with_metrics(StepMetrics::new().with_cost(cost).with_tokens(10, 5)),
                )
            }
        })),
    )
}

/// Like [`recording_step`] but fails with "boom" while `failing` is set.
fn flaky_step(name: &str, calls: &Calls, failing: &Arc<AtomicBool>, cost: f64) -> StepDefinition {
    let calls = calls.clone();
    let failing = failing.clone();
    let step = name.to_string();
    StepDefinition::new(
        name,
        InProcessStep::new(handler_fn(move |_ctx: StepContext| {
            let calls = calls.clone();
            let failing = failing.clone();
            let step = step.clone();
            async move {
                calls.lock().expect("lock").push(step);
                if failing.load(Ordering::SeqCst) {
                    return Err(HandlerError::Failed(anyhow!("boom")));
                }
                Ok(StepOutput::new().with_metrics(StepMetrics::new().with_cost(cost)))
            }
        })),
    )
}

fn config(dir: &TempDir) -> OrchestratorConfig {
    OrchestratorConfig::new()
        .with_output_dir(dir.path())
        .with_poll_interval(Duration::from_millis(50))
        .with_dependency_timeout(Duration::from_millis(300))
}

fn orchestrator(dir: &TempDir, pipeline: PipelineDefinition) -> Orchestrator {
    let mut registry = PipelineRegistry::new();
    registry.register(pipeline).expect("register");
    Orchestrator::new(config(dir), registry)
}

fn abc(calls: &Calls, failing: &Arc<AtomicBool>) -> PipelineDefinition {
    PipelineDefinition::new("abc")
        .with_step(recording_step("A", calls, 0.5))
        .with_step(flaky_step("B", calls, failing, 0.25))
        .with_step(recording_step("C", calls, 1.0))
}

fn executed(calls: &Calls) -> Vec<String> {
    calls.lock().expect("lock").clone()
}

async fn read_checkpoint(orch: &Orchestrator, run_id: &str) -> RunState {
    let raw = tokio::fs::read_to_string(orch.store().layout(run_id).checkpoint())
        .await
        .expect("checkpoint");
    serde_json::from_str(&raw).expect("valid checkpoint")
}

#[tokio::test]
async fn test_failed_step_stops_run_and_is_checkpointed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(true));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing));

    let outcome = orch.run(RunRequest::new("abc")).await.expect("run");

    assert!(!outcome.is_success());
    assert!(matches!(
        outcome.failure,
        Some(OrchestratorError::StepFailed { ref step, ref error }) if step == "B" && error == "boom"
    ));
    assert_eq!(executed(&calls), vec!["A", "B"]);

    let state = read_checkpoint(&orch, &outcome.state.run_id).await;
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_completed_step.as_deref(), Some("A"));
    assert_eq!(state.next_step.as_deref(), Some("B"));
    assert_eq!(state.error.as_deref(), Some("boom"));
    assert_eq!(
        state.steps.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["A", "B"]
    );
    assert_eq!(state.steps["A"].status, StepStatus::Completed);
    assert_eq!(state.steps["B"].status, StepStatus::Failed);
    assert_eq!(state.steps["B"].error.as_deref(), Some("boom"));
}

#[tokio::test]
async fn test_resume_runs_only_remaining_steps_and_totals_accumulate() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(true));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing));

    let first = orch.run(RunRequest::new("abc")).await.expect("run");
    let run_id = first.state.run_id.clone();
    assert!((first.state.total_cost - 0.5).abs() < 1e-9);

    failing.store(false, Ordering::SeqCst);
    calls.lock().expect("lock").clear();

    let second = orch
        .run(RunRequest::new("abc").resume(&run_id))
        .await
        .expect("resume");

    assert!(second.is_success());
    assert_eq!(executed(&calls), vec!["B", "C"]);
    assert_eq!(second.executed, vec!["B", "C"]);
    assert_eq!(second.skipped, vec!["A"]);
    assert_eq!(second.state.status, RunStatus::Completed);
    assert_eq!(second.state.error, None);
    assert_eq!(second.state.last_completed_step.as_deref(), Some("C"));
    assert_eq!(second.state.next_step, None);

    assert!((second.state.total_cost - 1.75).abs() < 1e-9);
    assert_eq!(second.state.total_input_tokens, 20);
    assert_eq!(second.state.total_output_tokens, 10);
}

#[tokio::test]
async fn test_resuming_completed_run_executes_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(false));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing));

    let first = orch.run(RunRequest::new("abc")).await.expect("run");
    assert!(first.is_success());
    calls.lock().expect("lock").clear();

    let again = orch
        .run(RunRequest::new("abc").resume(&first.state.run_id))
        .await
        .expect("rerun");

    assert!(again.is_success());
    assert!(again.executed.is_empty());
    assert!(executed(&calls).is_empty());
    assert_eq!(again.skipped, vec!["A", "B", "C"]);
    assert_eq!(again.state.steps, first.state.steps);
    assert_eq!(again.state.total_cost, first.state.total_cost);

    // --force starts over.
    let forced = orch
        .run(RunRequest::new("abc").resume(&first.state.run_id).force(true))
        .await
        .expect("forced");
    assert_eq!(forced.executed, vec!["A", "B", "C"]);
    // Totals accumulate across attempts.
    assert!((forced.state.total_cost - 2.0 * first.state.total_cost).abs() < 1e-9);
}

#[tokio::test]
async fn test_validation_and_resume_errors_write_nothing() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let pipeline = PipelineDefinition::new("course")
        .with_param("topic")
        .with_step(recording_step("outline", &calls, 0.0));
    let orch = orchestrator(&temp_dir, pipeline);

    let err = orch.run(RunRequest::new("course")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(ref msg) if msg.contains("topic")));

    let err = orch
        .run(RunRequest::new("course").resume("20260101_000000_dead"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::UnknownRun(_)));

    assert!(executed(&calls).is_empty());
    assert!(orch.store().list_runs().await.expect("list").is_empty());
}

#[tokio::test]
async fn test_skip_requires_produced_keys() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let pipeline = PipelineDefinition::new("course")
        .with_step(recording_step("outline", &calls, 0.0).produces(["course_id"]))
        .with_step(recording_step("lessons", &calls, 0.0).requires(["course_id"]));
    let orch = orchestrator(&temp_dir, pipeline);

    let err = orch
        .run(RunRequest::new("course").skip("outline"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::MissingPrerequisite { ref step, ref key }
            if step == "outline" && key == "course_id"
    ));
    assert!(orch.store().list_runs().await.expect("list").is_empty());

    let outcome = orch
        .run(
            RunRequest::new("course")
                .skip("outline")
                .with_param("course_id", "c-42"),
        )
        .await
        .expect("run");
    assert!(outcome.is_success());
    assert_eq!(executed(&calls), vec!["lessons"]);
    assert_eq!(outcome.state.steps["outline"].status, StepStatus::Skipped);
    assert_eq!(outcome.state.identifiers["course_id"], "c-42");
}

#[tokio::test]
async fn test_dry_run_simulates_every_step() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let pipeline = PipelineDefinition::new("course")
        .with_step(recording_step("outline", &calls, 3.0).produces(["course_id"]))
        .with_step(recording_step("render", &calls, 3.0).requires(["course_id"]));
    let orch = orchestrator(&temp_dir, pipeline);

    let outcome = orch
        .run(RunRequest::new("course").dry_run(true))
        .await
        .expect("dry run");

    assert!(outcome.is_success());
    assert!(executed(&calls).is_empty());
    assert_eq!(outcome.state.total_cost, 0.0);
    assert_eq!(outcome.state.identifiers["course_id"], "dry-run-outline-course_id");
    assert_eq!(
        outcome.state.steps["render"].outputs["dry_run"],
        serde_json::Value::Bool(true)
    );
    assert!(outcome.layout.checkpoint().exists());
    assert!(outcome.layout.step_result("render").exists());
}

#[tokio::test]
async fn test_dry_run_cannot_resume_real_run() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(true));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing));

    let first = orch.run(RunRequest::new("abc")).await.expect("run");
    let run_id = first.state.run_id.clone();
    let before = tokio::fs::read_to_string(orch.store().layout(&run_id).checkpoint())
        .await
        .expect("checkpoint");
    calls.lock().expect("lock").clear();

    let err = orch
        .run(RunRequest::new("abc").resume(&run_id).dry_run(true))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Validation(ref msg) if msg.contains("--dry-run")));
    assert!(executed(&calls).is_empty());

    let after = tokio::fs::read_to_string(orch.store().layout(&run_id).checkpoint())
        .await
        .expect("checkpoint");
    assert_eq!(before, after);
    let state = read_checkpoint(&orch, &run_id).await;
    assert_eq!(state.status, RunStatus::Failed);
    assert!(!state.steps.contains_key("C"));

    // The steps that never ran still run on a real resume.
    failing.store(false, Ordering::SeqCst);
    let resumed = orch
        .run(RunRequest::new("abc").resume(&run_id))
        .await
        .expect("resume");
    assert!(resumed.is_success());
    assert_eq!(resumed.executed, vec!["B", "C"]);
    assert_eq!(executed(&calls), vec!["B", "C"]);
}

/// Executor that panics instead of returning a result.
struct PanickingStep;

#[async_trait]
impl StepExecutor for PanickingStep {
    fn strategy(&self) -> &'static str {
        "panicking"
    }

    async fn execute(&self, _ctx: &StepContext) -> StepResult {
        panic!("executor exploded")
    }
}

#[tokio::test]
async fn test_executor_panic_marks_run_failed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let pipeline = PipelineDefinition::new("course")
        .with_step(recording_step("outline", &calls, 0.5))
        .with_step(StepDefinition::new("render", PanickingStep))
        .with_step(recording_step("publish", &calls, 0.5));
    let orch = orchestrator(&temp_dir, pipeline);

    let err = orch
        .run(RunRequest::new("course").with_run_id("20261019_090000_abcd"))
        .await
        .unwrap_err();

    assert!(!err.is_resumable());
    assert!(matches!(
        err,
        OrchestratorError::Unexpected(ref msg) if msg.contains("executor exploded")
    ));
    assert_eq!(executed(&calls), vec!["outline"]);

    let runs = orch.store().list_runs().await.expect("list");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].run_id, "20261019_090000_abcd");

    let state = read_checkpoint(&orch, "20261019_090000_abcd").await;
    assert_eq!(state.status, RunStatus::Failed);
    assert!(state
        .error
        .as_deref()
        .is_some_and(|msg| msg.contains("executor exploded")));
    assert_eq!(state.steps["outline"].status, StepStatus::Completed);
    assert!(!state.steps.contains_key("publish"));
}

/// Serves `200 OK` on every connection until the task is dropped.
async fn spawn_healthy_server() -> (String, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let handle = tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\nok")
                    .await;
                let _ = socket.shutdown().await;
            });
        }
    });
    (format!("http://{}", addr), handle)
}

async fn closed_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    format!("http://{}", addr)
}

fn gated_registry(url: &str, calls: &Calls) -> PipelineRegistry {
    let gate = DependencyGate::new("content-api", url, DEFAULT_HEALTH_PATH, Duration::from_millis(200))
        .expect("gate")
        .with_remediation("Start it with `make api`");
    let mut registry = PipelineRegistry::new().with_dependency(gate);
    registry
        .register(
            PipelineDefinition::new("course")
                .with_step(recording_step("outline", calls, 0.0))
                .with_step(recording_step("publish", calls, 0.0).requiring_dependency()),
        )
        .expect("register");
    registry
}

#[tokio::test]
async fn test_unavailable_dependency_fails_resumably() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let orch = Orchestrator::new(config(&temp_dir), gated_registry(&closed_url().await, &calls));

    let outcome = orch.run(RunRequest::new("course")).await.expect("run");

    let failure = outcome.failure.as_ref().expect("failure");
    assert!(failure.is_resumable());
    assert!(matches!(failure, OrchestratorError::DependencyUnavailable { step, .. } if step == "publish"));
    assert!(failure.to_string().contains("make api"));
    assert_eq!(executed(&calls), vec!["outline"]);

    let state = read_checkpoint(&orch, &outcome.state.run_id).await;
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.last_completed_step.as_deref(), Some("outline"));
    assert_eq!(state.next_step.as_deref(), Some("publish"));
    assert!(state.step("publish").is_none());
    assert!(state.error.as_deref().unwrap_or_default().contains("make api"));

    // Once the dependency is up, resume picks up at the gated step.
    let (url, server) = spawn_healthy_server().await;
    let orch = Orchestrator::new(config(&temp_dir), gated_registry(&url, &calls));
    let resumed = orch
        .run(RunRequest::new("course").resume(&outcome.state.run_id))
        .await
        .expect("resume");
    server.abort();

    assert!(resumed.is_success());
    assert_eq!(resumed.executed, vec!["publish"]);
}

#[tokio::test]
async fn test_corrupt_checkpoint_is_not_resumed() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(true));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing));

    let outcome = orch.run(RunRequest::new("abc")).await.expect("run");
    let run_id = outcome.state.run_id.clone();
    tokio::fs::write(outcome.layout.checkpoint(), "{ not json")
        .await
        .expect("corrupt");

    let err = orch
        .run(RunRequest::new("abc").resume(&run_id))
        .await
        .unwrap_err();
    assert!(err.is_corrupt_state());
    assert!(!err.is_resumable());

    let store = StateStore::new(temp_dir.path());
    assert!(matches!(
        store.load_or_create(&run_id, "abc", None).await,
        Err(StateError::CorruptState { .. })
    ));
    assert!(matches!(
        store.load_or_create("20260101_000000_beef", "abc", None).await,
        Err(StateError::MissingParameters(_))
    ));
}

#[cfg(unix)]
#[tokio::test]
async fn test_process_steps_thread_identifiers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let pipeline = PipelineDefinition::new("course")
        .with_param("topic")
        .with_step(
            StepDefinition::new(
                "outline",
                ProcessStep::new([
                    "sh",
                    "-c",
                    r#"printf '{"course_id": "c-{topic}"}' > "$PIPELINE_OUTPUT_FILE""#,
                ]),
            )
            .produces(["course_id"]),
        )
        .with_step(
            StepDefinition::new(
                "publish",
                ProcessStep::new(["sh", "-c", "echo publishing {course_id}"]),
            )
            .requires(["course_id"]),
        );
    let orch = orchestrator(&temp_dir, pipeline);

    let outcome = orch
        .run(RunRequest::new("course").with_param("topic", "traits"))
        .await
        .expect("run");

    assert!(outcome.is_success(), "{:?}", outcome.state.error);
    assert_eq!(outcome.state.identifiers["course_id"], "c-traits");

    let log = tokio::fs::read_to_string(outcome.layout.step_output_log("publish"))
        .await
        .expect("step output log");
    assert!(log.contains("publishing c-traits"));
}

#[cfg(unix)]
#[tokio::test]
async fn test_batch_partial_failure_fails_step() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let pipeline = PipelineDefinition::new("lessons").with_param("items").with_step(
        StepDefinition::new(
            "render",
            CommandBatch::new("items", ["sh", "-c", "test {item} != bad"]).into_step(),
        ),
    );
    let orch = orchestrator(&temp_dir, pipeline);

    let outcome = orch
        .run(RunRequest::new("lessons").with_param("items", "intro, bad, outro"))
        .await
        .expect("run");

    assert_eq!(outcome.state.status, RunStatus::Failed);
    let record = outcome.state.step("render").expect("render");
    assert_eq!(record.status, StepStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("1 of 3 items failed"));
}

#[tokio::test]
async fn test_run_writes_logs_reports_and_events() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let router = LogRouter::new();
    let subscriber = tracing_subscriber::registry().with(RunLogLayer::new(router.clone()));
    let _guard = tracing::subscriber::set_default(subscriber);

    let calls = Calls::default();
    let failing = Arc::new(AtomicBool::new(false));
    let orch = orchestrator(&temp_dir, abc(&calls, &failing)).with_log_router(router.clone());

    let outcome = orch.run(RunRequest::new("abc")).await.expect("run");
    assert!(outcome.is_success());
    assert!(!router.is_attached(&outcome.state.run_id));

    let layout = &outcome.layout;
    let pipeline_log = std::fs::read_to_string(layout.pipeline_log()).expect("pipeline log");
    assert!(!pipeline_log.is_empty());
    assert!(layout.step_log("B").exists());
    assert!(layout.summary().exists());
    assert!(layout.metrics().exists());
    assert!(layout.prometheus().exists());
    assert!(layout.step_report("C").exists());

    let summary: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(layout.summary()).expect("summary"))
            .expect("summary json");
    assert_eq!(summary["status"], "completed");

    let events = EventLog::new(layout.events()).read_all().await.expect("events");
    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(names.first(), Some(&"run_started"));
    assert_eq!(names.last(), Some(&"run_completed"));
    assert_eq!(names.iter().filter(|n| **n == "step_completed").count(), 3);
    assert!(events.iter().all(|e| e.run_id == outcome.state.run_id));
    assert_eq!(outcome.state.parameters, BTreeMap::new());
}
