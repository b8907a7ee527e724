//! File-backed checkpoint storage.
//!
//! Every run owns a directory under the store's base path, named by its run
//! identifier. Writes go to a sibling temporary file which is flushed and then
//! renamed over the destination, so readers only ever see a complete file and
//! a crash mid-write leaves the previous checkpoint intact.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::layout::RunLayout;
use super::types::{RunDetail, RunState, RunStatus, RunSummary};
use crate::error::StateError;

/// Durable storage for [`RunState`] checkpoints and step artifacts.
#[derive(Debug, Clone)]
pub struct StateStore {
    base_path: PathBuf,
}

impl StateStore {
    /// Creates a store rooted at `base_path`. Nothing is created on disk
    /// until the first save.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    /// Returns the base storage path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Layout of the directory owned by `run_id`.
    pub fn layout(&self, run_id: &str) -> RunLayout {
        RunLayout::new(self.base_path.join(run_id))
    }

    /// Checks whether a checkpoint exists for `run_id`.
    pub fn exists(&self, run_id: &str) -> bool {
        validate_run_id(run_id).is_ok() && self.layout(run_id).checkpoint().exists()
    }

    /// Loads the checkpoint of an existing run.
    ///
    /// # Errors
    ///
    /// `NotFound` when no checkpoint exists, `CorruptState` when it exists but
    /// cannot be parsed.
    pub async fn load(&self, run_id: &str) -> Result<RunState, StateError> {
        validate_run_id(run_id)?;
        let path = self.layout(run_id).checkpoint();

        let contents = match fs::read_to_string(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StateError::NotFound(run_id.to_string()))
            }
            Err(e) => return Err(StateError::Io(e)),
        };

        serde_json::from_str(&contents).map_err(|source| StateError::CorruptState { path, source })
    }

    /// Loads the checkpoint for `run_id`, or creates a new pending run.
    ///
    /// When a checkpoint exists, `parameters` is ignored. Otherwise
    /// `parameters` must be supplied; the new state is returned without being
    /// persisted (the first [`save`](Self::save) writes it).
    pub async fn load_or_create(
        &self,
        run_id: &str,
        pipeline_kind: &str,
        parameters: Option<BTreeMap<String, String>>,
    ) -> Result<RunState, StateError> {
        match self.load(run_id).await {
            Ok(state) => {
                debug!(run_id = %run_id, status = %state.status, "Loaded existing checkpoint");
                Ok(state)
            }
            Err(StateError::NotFound(_)) => match parameters {
                Some(parameters) => Ok(RunState::new(run_id, pipeline_kind, parameters)),
                None => Err(StateError::MissingParameters(run_id.to_string())),
            },
            Err(e) => Err(e),
        }
    }

    /// Persists `state`, refreshing `updated_at` first.
    pub async fn save(&self, state: &mut RunState) -> Result<(), StateError> {
        validate_run_id(&state.run_id)?;
        state.updated_at = Utc::now();

        let json = serde_json::to_vec_pretty(state)?;
        let path = self.layout(&state.run_id).checkpoint();
        write_atomic(&path, &json).await?;

        debug!(
            run_id = %state.run_id,
            status = %state.status,
            next_step = ?state.next_step,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Stores a detailed per-step payload outside the main checkpoint.
    pub async fn save_step_artifact(
        &self,
        run_id: &str,
        step_name: &str,
        payload: &Value,
    ) -> Result<PathBuf, StateError> {
        validate_run_id(run_id)?;
        let path = self.layout(run_id).step_result(step_name);
        let json = serde_json::to_vec_pretty(payload)?;
        write_atomic(&path, &json).await?;
        Ok(path)
    }

    /// Loads a per-step payload written by
    /// [`save_step_artifact`](Self::save_step_artifact).
    pub async fn load_step_artifact(
        &self,
        run_id: &str,
        step_name: &str,
    ) -> Result<Option<Value>, StateError> {
        validate_run_id(run_id)?;
        let path = self.layout(run_id).step_result(step_name);

        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io(e)),
        }
    }

    /// Lists all persisted runs, newest first.
    ///
    /// Unreadable or corrupt checkpoints are logged and skipped.
    pub async fn list_runs(&self) -> Result<Vec<RunSummary>, StateError> {
        let mut runs: Vec<RunSummary> = self
            .scan()
            .await?
            .into_iter()
            .map(|state| state.summary())
            .collect();

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(runs)
    }

    /// Returns the detail view for `run_id`, or `None` when it does not exist.
    pub async fn get_run_details(&self, run_id: &str) -> Result<Option<RunDetail>, StateError> {
        match self.load(run_id).await {
            Ok(state) => Ok(Some(state.detail())),
            Err(StateError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Deletes runs started more than `max_age` ago.
    ///
    /// With `keep_successful`, completed runs are kept regardless of age.
    /// Returns the number of run directories removed.
    pub async fn cleanup_old_runs(
        &self,
        max_age: ChronoDuration,
        keep_successful: bool,
    ) -> Result<usize, StateError> {
        let Some(cutoff) = Utc::now().checked_sub_signed(max_age) else {
            debug!(
                max_age_days = max_age.num_days(),
                "Cleanup cutoff is out of range, nothing to remove"
            );
            return Ok(0);
        };
        let mut removed = 0;

        for state in self.scan().await? {
            if state.started_at >= cutoff {
                continue;
            }
            if keep_successful && state.status == RunStatus::Completed {
                continue;
            }

            let root = self.layout(&state.run_id).root().to_path_buf();
            match fs::remove_dir_all(&root).await {
                Ok(()) => {
                    info!(run_id = %state.run_id, status = %state.status, "Removed old run");
                    removed += 1;
                }
                Err(e) => warn!(run_id = %state.run_id, error = %e, "Failed to remove old run"),
            }
        }

        Ok(removed)
    }

    /// Reads every parseable checkpoint under the base path.
    async fn scan(&self) -> Result<Vec<RunState>, StateError> {
        if !self.base_path.exists() {
            return Ok(Vec::new());
        }

        let mut states = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let Some(run_id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !self.exists(&run_id) {
                continue;
            }

            match self.load(&run_id).await {
                Ok(state) => states.push(state),
                Err(e) => warn!(run_id = %run_id, error = %e, "Skipping unreadable run"),
            }
        }

        Ok(states)
    }
}

/// Rejects identifiers that could escape the store's base directory.
fn validate_run_id(run_id: &str) -> Result<(), StateError> {
    let valid = !run_id.is_empty()
        && run_id != "."
        && run_id != ".."
        && run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));

    if valid {
        Ok(())
    } else {
        Err(StateError::InvalidRunId(run_id.to_string()))
    }
}

/// Writes `bytes` to a flushed temporary sibling of `path`.
async fn write_temp(path: &Path, bytes: &[u8]) -> Result<PathBuf, StateError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("state");
    let temp_path = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let mut file = fs::File::create(&temp_path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;

    Ok(temp_path)
}

/// Atomically replaces `path` with `bytes` (write temp, flush, rename).
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StateError> {
    let temp_path = write_temp(path, bytes).await?;

    if let Err(e) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StateError::Io(e));
    }

    Ok(())
}
