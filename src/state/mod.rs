//! Durable run state.
//!
//! - [`types`]: the persisted data model (`RunState`, `StepRecord`, metrics)
//! - [`store`]: crash-safe, file-backed persistence keyed by run identifier
//! - [`layout`]: where each run's checkpoint, reports and logs live

pub mod layout;
pub mod store;
pub mod types;

pub use layout::RunLayout;
pub use store::StateStore;
pub use types::{
    generate_run_id, FailureKind, RunDetail, RunState, RunStatus, RunSummary, StepDetail,
    StepMetrics, StepOutputs, StepRecord, StepStatus,
};
