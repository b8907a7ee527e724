//! Run-scoped log files.
//!
//! The orchestrator opens a `run` span carrying `run_id` for every run
//! attempt and a nested `step` span carrying `step` around each step.
//! [`RunLogLayer`] picks events up inside those spans and hands them to a
//! [`LogRouter`], which appends them to `logs/pipeline.log` and, inside a step,
//! to `logs/steps/<step>.log` as well. Runs must be attached to the router to
//! get files; events of unattached runs only reach the console.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter, Layer};

use crate::state::RunLayout;

/// Span name the orchestrator uses for a run attempt.
pub const RUN_SPAN: &str = "run";
/// Span name the orchestrator uses for a single step.
pub const STEP_SPAN: &str = "step";

/// Directives for the run log files. Debug for everything except chatty
/// HTTP internals.
const RUN_LOG_DIRECTIVES: &str = "debug,hyper=info,hyper_util=info,reqwest=info,h2=info,rustls=info";

struct RunFiles {
    layout: RunLayout,
    pipeline: File,
    steps: HashMap<String, File>,
}

/// Shared registry of open run log files.
#[derive(Clone, Default)]
pub struct LogRouter {
    runs: Arc<Mutex<HashMap<String, RunFiles>>>,
}

impl std::fmt::Debug for LogRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let attached = self.runs.lock().map(|runs| runs.len()).unwrap_or(0);
        f.debug_struct("LogRouter")
            .field("attached_runs", &attached)
            .finish()
    }
}

impl LogRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts routing events of `run_id` into the run's log directory.
    pub fn attach(&self, run_id: &str, layout: &RunLayout) -> std::io::Result<()> {
        let pipeline = open_append(&layout.pipeline_log())?;
        let files = RunFiles {
            layout: layout.clone(),
            pipeline,
            steps: HashMap::new(),
        };

        if let Ok(mut runs) = self.runs.lock() {
            runs.insert(run_id.to_string(), files);
        }
        Ok(())
    }

    /// Stops routing `run_id` and closes its files.
    pub fn detach(&self, run_id: &str) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.remove(run_id);
        }
    }

    pub fn is_attached(&self, run_id: &str) -> bool {
        self.runs
            .lock()
            .map(|runs| runs.contains_key(run_id))
            .unwrap_or(false)
    }

    /// Appends `line` to the run log and, when given, the step log.
    /// Write failures are dropped.
    fn write(&self, run_id: &str, step: Option<&str>, line: &str) {
        let Ok(mut runs) = self.runs.lock() else {
            return;
        };
        let Some(files) = runs.get_mut(run_id) else {
            return;
        };

        let _ = files.pipeline.write_all(line.as_bytes());

        if let Some(step) = step {
            if !files.steps.contains_key(step) {
                match open_append(&files.layout.step_log(step)) {
                    Ok(file) => {
                        files.steps.insert(step.to_string(), file);
                    }
                    Err(_) => return,
                }
            }
            if let Some(file) = files.steps.get_mut(step) {
                let _ = file.write_all(line.as_bytes());
            }
        }
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Routing keys stored on `run` and `step` spans.
#[derive(Debug, Default, Clone)]
struct SpanTag {
    run_id: Option<String>,
    step: Option<String>,
}

/// Collects the message and fields of an event, or the routing keys of a span.
#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: String,
    run_id: Option<String>,
    step: Option<String>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "run_id" => self.run_id = Some(value.to_string()),
            "step" => self.step = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "run_id" => self.run_id = Some(format!("{:?}", value).trim_matches('"').to_string()),
            "step" => self.step = Some(format!("{:?}", value).trim_matches('"').to_string()),
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }
}

/// `tracing` layer writing events of attached runs to their log files.
#[derive(Debug, Clone)]
pub struct RunLogLayer {
    router: LogRouter,
}

impl RunLogLayer {
    pub fn new(router: LogRouter) -> Self {
        Self { router }
    }
}

impl<S> Layer<S> for RunLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let name = attrs.metadata().name();
        if name != RUN_SPAN && name != STEP_SPAN {
            return;
        }

        let mut collector = FieldCollector::default();
        attrs.record(&mut collector);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanTag {
                run_id: collector.run_id,
                step: collector.step,
            });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };

        let mut run_id = None;
        let mut step = None;
        for span in scope {
            if let Some(tag) = span.extensions().get::<SpanTag>() {
                if step.is_none() {
                    step = tag.step.clone();
                }
                if run_id.is_none() {
                    run_id = tag.run_id.clone();
                }
            }
            if run_id.is_some() {
                break;
            }
        }
        let Some(run_id) = run_id else {
            return;
        };
        if !self.router.is_attached(&run_id) {
            return;
        }

        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let metadata = event.metadata();
        let line = format!(
            "{} {:>5} {}: {}{}\n",
            Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            metadata.level().to_string(),
            metadata.target(),
            collector.message,
            collector.fields
        );
        self.router.write(&run_id, step.as_deref(), &line);
    }
}

/// Installs the global subscriber: console output filtered by `RUST_LOG` or
/// `log_level`, plus debug-level run log files.
///
/// Returns the router to hand to the orchestrator.
pub fn init_logging(log_level: &str) -> LogRouter {
    let router = LogRouter::new();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_filter(console_filter))
        .with(RunLogLayer::new(router.clone()).with_filter(EnvFilter::new(RUN_LOG_DIRECTIVES)))
        .init();

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tracing::{debug, info, info_span, Instrument};

    #[tokio::test]
    async fn test_events_routed_to_run_and_step_logs() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let layout = RunLayout::new(temp_dir.path());
        let router = LogRouter::new();
        router.attach("r1", &layout).expect("attach");

        let subscriber = tracing_subscriber::registry().with(RunLogLayer::new(router.clone()));
        let _guard = tracing::subscriber::set_default(subscriber);

        async {
            info!("run begins");
            async {
                debug!(items = 3, "inside step");
            }
            .instrument(info_span!("step", step = "outline"))
            .await;
        }
        .instrument(info_span!("run", run_id = "r1", pipeline = "course"))
        .await;

        info!("outside any run");
        router.detach("r1");

        let run_log = std::fs::read_to_string(layout.pipeline_log()).expect("run log");
        assert!(run_log.contains("run begins"));
        assert!(run_log.contains("inside step items=3"));
        assert!(run_log.contains("DEBUG"));
        assert!(!run_log.contains("outside any run"));

        let step_log = std::fs::read_to_string(layout.step_log("outline")).expect("step log");
        assert!(step_log.contains("inside step"));
        assert!(!step_log.contains("run begins"));
    }

    #[test]
    fn test_unattached_run_writes_nothing() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let layout = RunLayout::new(temp_dir.path());
        let router = LogRouter::new();

        let subscriber = tracing_subscriber::registry().with(RunLogLayer::new(router.clone()));
        tracing::subscriber::with_default(subscriber, || {
            let span = info_span!("run", run_id = "r2");
            let _entered = span.enter();
            info!("nobody listening");
        });

        assert!(!router.is_attached("r2"));
        assert!(!layout.pipeline_log().exists());
    }
}
