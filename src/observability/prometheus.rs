//! Prometheus metrics registration and export.
//!
//! Process-wide counters for step outcomes, durations, cost and token usage.
//! The observability sink records into them and snapshots the text exposition
//! into each run's report directory.

use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all stepforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Step executions, labeled by pipeline, step and status.
pub static STEPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Step duration in seconds, labeled by pipeline and step.
pub static STEP_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Runs finished, labeled by pipeline and status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Accumulated step cost in dollars, labeled by pipeline.
pub static COST_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Tokens consumed, labeled by pipeline and type (input/output).
pub static TOKENS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Calling this more than once is harmless; later calls keep the metrics
/// created by the first.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    let steps_total = CounterVec::new(
        Opts::new("stepforge_steps_total", "Total number of step executions"),
        &["pipeline", "step", "status"],
    )?;

    let step_duration = HistogramVec::new(
        HistogramOpts::new(
            "stepforge_step_duration_seconds",
            "Step execution duration in seconds",
        )
        .buckets(vec![0.1, 1.0, 5.0, 30.0, 60.0, 300.0, 900.0, 3600.0]),
        &["pipeline", "step"],
    )?;

    let runs_total = CounterVec::new(
        Opts::new("stepforge_runs_total", "Total number of finished runs"),
        &["pipeline", "status"],
    )?;

    let cost_total = CounterVec::new(
        Opts::new("stepforge_cost_total", "Accumulated step cost in dollars"),
        &["pipeline"],
    )?;

    let tokens_total = CounterVec::new(
        Opts::new("stepforge_tokens_total", "Total tokens used"),
        &["pipeline", "type"],
    )?;

    registry.register(Box::new(steps_total.clone()))?;
    registry.register(Box::new(step_duration.clone()))?;
    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(cost_total.clone()))?;
    registry.register(Box::new(tokens_total.clone()))?;

    // Losing a race here means another caller already initialized everything.
    let _ = REGISTRY.set(registry);
    let _ = STEPS_TOTAL.set(steps_total);
    let _ = STEP_DURATION.set(step_duration);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = COST_TOTAL.set(cost_total);
    let _ = TOKENS_TOTAL.set(tokens_total);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// Records one finished step attempt.
///
/// # Arguments
///
/// * `pipeline` - Pipeline kind
/// * `step` - Step name
/// * `status` - Final step status (`completed`, `failed`, `skipped`)
/// * `duration_secs` - Wall-clock duration
/// * `cost` - Cost in dollars reported by the step
/// * `tokens` - `(input, output)` token counts
pub fn record_step(
    pipeline: &str,
    step: &str,
    status: &str,
    duration_secs: f64,
    cost: f64,
    tokens: (u64, u64),
) {
    if let Some(steps_total) = STEPS_TOTAL.get() {
        steps_total
            .with_label_values(&[pipeline, step, status])
            .inc();
    }

    if let Some(step_duration) = STEP_DURATION.get() {
        step_duration
            .with_label_values(&[pipeline, step])
            .observe(duration_secs);
    }

    if let Some(cost_total) = COST_TOTAL.get() {
        if cost > 0.0 {
            cost_total.with_label_values(&[pipeline]).inc_by(cost);
        }
    }

    if let Some(tokens_total) = TOKENS_TOTAL.get() {
        tokens_total
            .with_label_values(&[pipeline, "input"])
            .inc_by(tokens.0 as f64);
        tokens_total
            .with_label_values(&[pipeline, "output"])
            .inc_by(tokens.1 as f64);
    }

    tracing::trace!(
        pipeline = pipeline,
        step = step,
        status = status,
        duration_secs = duration_secs,
        "Recorded step metric"
    );
}

/// Records one finished run.
pub fn record_run(pipeline: &str, status: &str) {
    if let Some(runs_total) = RUNS_TOTAL.get() {
        runs_total.with_label_values(&[pipeline, status]).inc();
    }
}
