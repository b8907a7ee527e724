//! stepforge: checkpointed, resumable pipeline orchestration.
//!
//! A pipeline kind is an ordered list of named steps. Each run persists its
//! state after every step so a failed or interrupted run can resume from the
//! step that stopped it, and writes logs, events and metrics per run.

pub mod cli;
pub mod error;
pub mod executor;
pub mod gate;
pub mod observability;
pub mod pipeline;
pub mod state;

// Re-export commonly used types
pub use error::{GateError, ManifestError, OrchestratorError, StateError};
pub use executor::{StepContext, StepExecutor, StepFailure, StepResult};
pub use gate::DependencyGate;
pub use pipeline::{
    Orchestrator, OrchestratorConfig, PipelineDefinition, PipelineRegistry, RunOutcome,
    RunRequest, StepDefinition,
};
pub use state::{RunState, RunStatus, StateStore, StepStatus};
