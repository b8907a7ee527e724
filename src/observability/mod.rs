//! Run observability: log files, event stream, reports and metrics.
//!
//! - [`sink`]: lifecycle hooks the orchestrator calls for every run attempt
//! - [`events`]: append-only JSON-lines event stream
//! - [`logging`]: `tracing` layer routing run and step events to log files
//! - [`prometheus`]: process-wide Prometheus counters

pub mod events;
pub mod logging;
pub mod prometheus;
pub mod sink;

pub use events::{EventLog, PipelineEvent};
pub use logging::{init_logging, LogRouter, RunLogLayer, RUN_SPAN, STEP_SPAN};
pub use prometheus::{export_metrics, init_metrics};
pub use sink::{AttemptTotals, ObservabilitySink};
