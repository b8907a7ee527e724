//! Error types for stepforge operations.
//!
//! Defines error types for the layers that can fail:
//! - Checkpoint persistence (State Store)
//! - Health-check client construction (Dependency Gate)
//! - Pipeline manifest loading
//! - Orchestration (the taxonomy surfaced to callers and the CLI)
//!
//! Step failures are not errors: executors report them as values inside a
//! `StepResult` and the orchestrator records them in the run state.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during checkpoint persistence.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("No checkpoint exists for run '{0}' and no parameters were supplied to create one")]
    MissingParameters(String),

    #[error("Run '{0}' not found")]
    NotFound(String),

    #[error("Corrupt checkpoint at {path:?}: {source}")]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid run identifier '{0}'")]
    InvalidRunId(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while building a dependency gate.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("Invalid dependency URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Errors that can occur while loading a pipeline manifest.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Failed to read manifest {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid pipeline '{kind}': {reason}")]
    InvalidPipeline { kind: String, reason: String },

    #[error("Invalid step '{step}' in pipeline '{kind}': {reason}")]
    InvalidStep {
        kind: String,
        step: String,
        reason: String,
    },

    #[error("Dependency gate error: {0}")]
    Gate(#[from] GateError),
}

/// Errors surfaced by the orchestrator.
///
/// Step failures and dependency timeouts are recorded in the run state before
/// the orchestrator reports them; validation and resume errors are raised
/// before any checkpoint is written.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown pipeline kind '{0}'")]
    UnknownPipeline(String),

    #[error("Cannot resume: no checkpoint found for run '{0}'")]
    UnknownRun(String),

    #[error("Step '{step}' is skipped but its output '{key}' was not supplied (pass it as a parameter)")]
    MissingPrerequisite { step: String, key: String },

    #[error("Dependency '{dependency}' unavailable before step '{step}': {message}\n{remediation}")]
    DependencyUnavailable {
        step: String,
        dependency: String,
        message: String,
        remediation: String,
    },

    #[error("Step '{step}' failed: {error}")]
    StepFailed { step: String, error: String },

    #[error("Checkpoint error: {0}")]
    State(#[from] StateError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl OrchestratorError {
    /// True for errors that leave a resumable `failed` checkpoint behind.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::DependencyUnavailable { .. } | OrchestratorError::StepFailed { .. }
        )
    }

    /// True when the checkpoint could not be read and needs manual attention.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(
            self,
            OrchestratorError::State(StateError::CorruptState { .. })
        )
    }
}
