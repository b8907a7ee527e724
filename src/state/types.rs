//! Persisted data model for pipeline runs.
//!
//! A [`RunState`] is the checkpoint of one run: its parameters, the history of
//! every step that has been attempted, derived resume pointers, and running
//! cost/token aggregates. Step payloads are opaque JSON objects except for the
//! handful of metric fields the orchestrator aggregates (see [`StepMetrics`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form step payload.
pub type StepOutputs = Map<String, Value>;

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet attempted.
    Pending,
    /// Executor currently running.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Not executed on request; counts as done for resume purposes.
    Skipped,
}

impl StepStatus {
    /// Returns true when the step no longer blocks the steps after it.
    pub fn is_done(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Pending => write!(f, "pending"),
            StepStatus::InProgress => write!(f, "in_progress"),
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunStatus::Pending => write!(f, "pending"),
            RunStatus::InProgress => write!(f, "in_progress"),
            RunStatus::Completed => write!(f, "completed"),
            RunStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Distinguishes a step that could not start from one that ran and failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PreconditionFailed,
    ExecutionFailed,
}

/// Metrics reported by a step.
///
/// The orchestrator only reasons about `cost`, `input_tokens` and
/// `output_tokens`; every other key is carried through untouched in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    /// Cost in dollars.
    #[serde(default)]
    pub cost: f64,
    /// Input (prompt) tokens consumed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Output (completion) tokens produced.
    #[serde(default)]
    pub output_tokens: u64,
    /// Any other step-defined metrics.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StepMetrics {
    /// Creates empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds metrics from a loosely-typed map.
    ///
    /// Known keys are extracted when they hold numbers and default to zero
    /// otherwise. Non-numeric values under known keys are kept in `extra`.
    pub fn from_map(mut map: Map<String, Value>) -> Self {
        let cost = take_number(&mut map, "cost").unwrap_or(0.0);
        let input_tokens = take_number(&mut map, "input_tokens").unwrap_or(0.0);
        let output_tokens = take_number(&mut map, "output_tokens").unwrap_or(0.0);

        Self {
            cost: if cost.is_finite() && cost > 0.0 { cost } else { 0.0 },
            input_tokens: to_count(input_tokens),
            output_tokens: to_count(output_tokens),
            extra: map,
        }
    }

    /// Sets the cost.
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    /// Sets token counts.
    pub fn with_tokens(mut self, input_tokens: u64, output_tokens: u64) -> Self {
        self.input_tokens = input_tokens;
        self.output_tokens = output_tokens;
        self
    }

    /// Adds a pass-through metric.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn cost(&self) -> f64 {
        self.cost
    }

    pub fn input_tokens(&self) -> u64 {
        self.input_tokens
    }

    pub fn output_tokens(&self) -> u64 {
        self.output_tokens
    }

    /// Input plus output tokens.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }

    /// Adds the known numeric fields of `other` into `self`.
    ///
    /// Pass-through fields that are numbers on both sides are summed as well;
    /// anything else keeps the first value seen.
    pub fn accumulate(&mut self, other: &StepMetrics) {
        self.cost += other.cost;
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);

        for (key, value) in &other.extra {
            match (self.extra.get(key).and_then(Value::as_f64), value.as_f64()) {
                (Some(a), Some(b)) => {
                    if let Some(sum) = serde_json::Number::from_f64(a + b) {
                        self.extra.insert(key.clone(), Value::Number(sum));
                    }
                }
                _ => {
                    self.extra.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }
    }
}

fn take_number(map: &mut Map<String, Value>, key: &str) -> Option<f64> {
    let number = map.get(key).and_then(Value::as_f64)?;
    map.remove(key);
    Some(number)
}

fn to_count(value: f64) -> u64 {
    if value.is_finite() && value > 0.0 {
        value as u64
    } else {
        0
    }
}

/// History of one step within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    #[serde(default)]
    pub outputs: StepOutputs,
    #[serde(default)]
    pub metrics: StepMetrics,
    /// Present iff `status` is `Failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
}

impl StepRecord {
    /// Creates a pending record.
    pub fn pending(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            duration_seconds: None,
            outputs: StepOutputs::new(),
            metrics: StepMetrics::default(),
            error: None,
            failure_kind: None,
        }
    }

    /// Creates a record for a step skipped on request.
    pub fn skipped(name: impl Into<String>, reason: &str) -> Self {
        let now = Utc::now();
        let mut outputs = StepOutputs::new();
        outputs.insert("skip_reason".to_string(), Value::String(reason.to_string()));

        Self {
            status: StepStatus::Skipped,
            started_at: Some(now),
            completed_at: Some(now),
            duration_seconds: Some(0.0),
            outputs,
            ..Self::pending(name)
        }
    }

    /// Duration in seconds, derived from timestamps when not stored.
    pub fn effective_duration(&self) -> Option<f64> {
        self.duration_seconds.or_else(|| match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(seconds_between(start, end)),
            _ => None,
        })
    }
}

/// Full checkpoint of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub pipeline_kind: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepRecord>,
    #[serde(default)]
    pub last_completed_step: Option<String>,
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(default)]
    pub total_cost: f64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub total_input_tokens: u64,
    #[serde(default)]
    pub total_output_tokens: u64,
    /// Identifiers produced by steps and threaded to later steps.
    #[serde(default)]
    pub identifiers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Creates a new pending run.
    pub fn new(
        run_id: impl Into<String>,
        pipeline_kind: impl Into<String>,
        parameters: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            pipeline_kind: pipeline_kind.into(),
            parameters,
            status: RunStatus::Pending,
            started_at: now,
            updated_at: now,
            steps: BTreeMap::new(),
            last_completed_step: None,
            next_step: None,
            total_cost: 0.0,
            total_tokens: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            identifiers: BTreeMap::new(),
            error: None,
        }
    }

    /// Returns the record for `name`, if the step has been attempted.
    pub fn step(&self, name: &str) -> Option<&StepRecord> {
        self.steps.get(name)
    }

    /// Status of `name`, `Pending` when never attempted.
    pub fn step_status(&self, name: &str) -> StepStatus {
        self.steps
            .get(name)
            .map(|record| record.status)
            .unwrap_or(StepStatus::Pending)
    }

    /// Looks up a value by key: produced identifiers first, then parameters.
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.identifiers
            .get(key)
            .or_else(|| self.parameters.get(key))
            .map(String::as_str)
    }

    /// Stores `record`, replacing any earlier record for the same step, and
    /// adds its metrics to the run aggregates.
    pub fn record_step<S: AsRef<str>>(&mut self, record: StepRecord, sequence: &[S]) {
        self.total_cost += record.metrics.cost;
        self.total_input_tokens = self
            .total_input_tokens
            .saturating_add(record.metrics.input_tokens);
        self.total_output_tokens = self
            .total_output_tokens
            .saturating_add(record.metrics.output_tokens);
        self.total_tokens = self
            .total_tokens
            .saturating_add(record.metrics.total_tokens());

        self.steps.insert(record.name.clone(), record);
        self.recompute_pointers(sequence);
    }

    /// Recomputes `last_completed_step` and `next_step` against the fixed
    /// step order.
    ///
    /// `last_completed_step` is the last step of the leading run of done
    /// steps; `next_step` is the first step that is not done.
    pub fn recompute_pointers<S: AsRef<str>>(&mut self, sequence: &[S]) {
        let mut last = None;
        let mut next = None;

        for name in sequence {
            let name = name.as_ref();
            if self.step_status(name).is_done() {
                last = Some(name.to_string());
            } else {
                next = Some(name.to_string());
                break;
            }
        }

        self.last_completed_step = last;
        self.next_step = next;
    }

    /// Index into `sequence` at which a resumed run starts.
    pub fn resume_index<S: AsRef<str>>(&self, sequence: &[S]) -> usize {
        match &self.last_completed_step {
            None => 0,
            Some(last) => sequence
                .iter()
                .position(|name| name.as_ref() == last)
                .map(|idx| idx + 1)
                .unwrap_or(0),
        }
    }

    pub fn mark_in_progress(&mut self) {
        self.status = RunStatus::InProgress;
        self.error = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
    }

    /// Number of steps whose status is `Completed`.
    pub fn completed_count(&self) -> usize {
        self.steps
            .values()
            .filter(|record| record.status == StepStatus::Completed)
            .count()
    }

    /// Summary view used by run listings.
    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            pipeline_kind: self.pipeline_kind.clone(),
            parameters: self.parameters.clone(),
            status: self.status,
            started_at: self.started_at,
            updated_at: self.updated_at,
            last_completed_step: self.last_completed_step.clone(),
            next_step: self.next_step.clone(),
            total_cost: self.total_cost,
            total_tokens: self.total_tokens,
            error: self.error.clone(),
        }
    }

    /// Denormalized view with per-step and total durations.
    ///
    /// Steps are ordered by start time. The total duration is the sum of step
    /// durations when any are known, otherwise the span between `started_at`
    /// and `updated_at`.
    pub fn detail(&self) -> RunDetail {
        let mut steps: Vec<StepDetail> = self
            .steps
            .values()
            .map(|record| StepDetail {
                name: record.name.clone(),
                status: record.status,
                started_at: record.started_at,
                completed_at: record.completed_at,
                duration_seconds: record.effective_duration(),
                cost: record.metrics.cost,
                tokens: record.metrics.total_tokens(),
                error: record.error.clone(),
            })
            .collect();
        steps.sort_by_key(|step| step.started_at);

        let known: Vec<f64> = steps.iter().filter_map(|s| s.duration_seconds).collect();
        let total_duration_seconds = if known.is_empty() {
            seconds_between(self.started_at, self.updated_at)
        } else {
            known.iter().sum()
        };

        RunDetail {
            summary: self.summary(),
            identifiers: self.identifiers.clone(),
            steps,
            total_duration_seconds,
        }
    }
}

/// Generates a timestamp-derived run identifier, e.g. `20261019_142501_3fa2`.
pub fn generate_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}", Utc::now().format("%Y%m%d_%H%M%S"), &suffix[..4])
}

/// Seconds between two instants, never negative.
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let millis = (end - start).num_milliseconds().max(0);
    millis as f64 / 1000.0
}

/// One row of a run listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: String,
    pub pipeline_kind: String,
    pub parameters: BTreeMap<String, String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_completed_step: Option<String>,
    pub next_step: Option<String>,
    pub total_cost: f64,
    pub total_tokens: u64,
    pub error: Option<String>,
}

/// Per-step line of a [`RunDetail`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDetail {
    pub name: String,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<f64>,
    pub cost: f64,
    pub tokens: u64,
    pub error: Option<String>,
}

/// Inspection view of a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDetail {
    #[serde(flatten)]
    pub summary: RunSummary,
    pub identifiers: BTreeMap<String, String>,
    pub steps: Vec<StepDetail>,
    pub total_duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use serde_json::json;

    const SEQUENCE: [&str; 3] = ["a", "b", "c"];

    fn record(name: &str, status: StepStatus, cost: f64, tokens: (u64, u64)) -> StepRecord {
        StepRecord {
            status,
            metrics: StepMetrics::new().with_cost(cost).with_tokens(tokens.0, tokens.1),
            ..StepRecord::pending(name)
        }
    }

    #[test]
    fn test_metrics_from_map_extracts_known_keys() {
        let map = json!({"cost": 0.25, "input_tokens": 100, "output_tokens": 40, "model": "m1"});
        let metrics = StepMetrics::from_map(map.as_object().cloned().unwrap_or_default());

        assert!((metrics.cost() - 0.25).abs() < f64::EPSILON);
        assert_eq!(metrics.input_tokens(), 100);
        assert_eq!(metrics.output_tokens(), 40);
        assert_eq!(metrics.total_tokens(), 140);
        assert_eq!(metrics.extra.get("model"), Some(&json!("m1")));
    }

    #[test]
    fn test_metrics_from_map_defaults_missing_and_invalid() {
        let map = json!({"cost": "free", "input_tokens": -5});
        let metrics = StepMetrics::from_map(map.as_object().cloned().unwrap_or_default());

        assert_eq!(metrics.cost(), 0.0);
        assert_eq!(metrics.input_tokens(), 0);
        assert_eq!(metrics.output_tokens(), 0);
        // Non-numeric value under a known key is passed through.
        assert_eq!(metrics.extra.get("cost"), Some(&json!("free")));
    }

    #[test]
    fn test_metrics_accumulate() {
        let mut total = StepMetrics::new().with_extra("calls", 2);
        total.accumulate(
            &StepMetrics::new()
                .with_cost(1.5)
                .with_tokens(10, 5)
                .with_extra("calls", 3),
        );

        assert!((total.cost - 1.5).abs() < f64::EPSILON);
        assert_eq!(total.total_tokens(), 15);
        assert_eq!(total.extra.get("calls").and_then(Value::as_f64), Some(5.0));
    }

    #[test]
    fn test_metrics_serde_flattens_extra() {
        let metrics = StepMetrics::new().with_cost(0.1).with_extra("retries", 1);
        let value = serde_json::to_value(&metrics).expect("serialize");
        assert_eq!(value["retries"], json!(1));

        let parsed: StepMetrics = serde_json::from_value(json!({"retries": 1})).expect("parse");
        assert_eq!(parsed.cost, 0.0);
        assert_eq!(parsed.extra.get("retries"), Some(&json!(1)));
    }

    #[test]
    fn test_record_step_updates_pointers_and_totals() {
        let mut state = RunState::new("run-1", "demo", BTreeMap::new());

        state.record_step(record("a", StepStatus::Completed, 0.5, (10, 5)), &SEQUENCE);
        assert_eq!(state.last_completed_step.as_deref(), Some("a"));
        assert_eq!(state.next_step.as_deref(), Some("b"));

        state.record_step(record("b", StepStatus::Failed, 0.0, (3, 0)), &SEQUENCE);
        assert_eq!(state.last_completed_step.as_deref(), Some("a"));
        assert_eq!(state.next_step.as_deref(), Some("b"));
        assert!((state.total_cost - 0.5).abs() < f64::EPSILON);
        assert_eq!(state.total_tokens, 18);
        assert_eq!(state.total_input_tokens, 13);
        assert_eq!(state.resume_index(&SEQUENCE), 1);
    }

    #[test]
    fn test_record_step_replaces_existing_record() {
        let mut state = RunState::new("run-1", "demo", BTreeMap::new());
        state.record_step(record("a", StepStatus::Failed, 1.0, (0, 0)), &SEQUENCE);
        state.record_step(record("a", StepStatus::Completed, 2.0, (0, 0)), &SEQUENCE);

        assert_eq!(state.steps.len(), 1);
        assert_eq!(state.step_status("a"), StepStatus::Completed);
        // Aggregates never decrease across attempts.
        assert!((state.total_cost - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_skipped_counts_as_done() {
        let mut state = RunState::new("run-1", "demo", BTreeMap::new());
        state.record_step(StepRecord::skipped("a", "requested"), &SEQUENCE);
        state.record_step(record("b", StepStatus::Completed, 0.0, (0, 0)), &SEQUENCE);
        state.record_step(record("c", StepStatus::Completed, 0.0, (0, 0)), &SEQUENCE);

        assert_eq!(state.last_completed_step.as_deref(), Some("c"));
        assert!(state.next_step.is_none());
        assert_eq!(state.resume_index(&SEQUENCE), 3);
        assert_eq!(state.completed_count(), 2);
    }

    #[test]
    fn test_resume_index_without_progress() {
        let state = RunState::new("run-1", "demo", BTreeMap::new());
        assert_eq!(state.resume_index(&SEQUENCE), 0);
    }

    #[test]
    fn test_lookup_prefers_identifiers() {
        let mut params = BTreeMap::new();
        params.insert("course_id".to_string(), "from-param".to_string());
        params.insert("topic".to_string(), "rust".to_string());
        let mut state = RunState::new("run-1", "demo", params);
        state
            .identifiers
            .insert("course_id".to_string(), "from-step".to_string());

        assert_eq!(state.lookup("course_id"), Some("from-step"));
        assert_eq!(state.lookup("topic"), Some("rust"));
        assert_eq!(state.lookup("missing"), None);
    }

    #[test]
    fn test_detail_durations() {
        let mut state = RunState::new("run-1", "demo", BTreeMap::new());
        let start = state.started_at;
        state.updated_at = start + ChronoDuration::seconds(30);

        // No step durations: falls back to run span.
        assert!((state.detail().total_duration_seconds - 30.0).abs() < 1e-9);

        let mut a = record("a", StepStatus::Completed, 0.0, (0, 0));
        a.started_at = Some(start);
        a.completed_at = Some(start + ChronoDuration::seconds(4));
        let mut b = record("b", StepStatus::Completed, 0.0, (0, 0));
        b.started_at = Some(start + ChronoDuration::seconds(5));
        b.duration_seconds = Some(6.0);
        state.record_step(b, &SEQUENCE);
        state.record_step(a, &SEQUENCE);

        let detail = state.detail();
        assert_eq!(detail.steps[0].name, "a");
        assert_eq!(detail.steps[0].duration_seconds, Some(4.0));
        assert!((detail.total_duration_seconds - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_display() {
        assert_eq!(StepStatus::InProgress.to_string(), "in_progress");
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_generate_run_id_shape() {
        let id = generate_run_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 4);
    }
}
