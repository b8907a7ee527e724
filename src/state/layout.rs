//! On-disk layout of a run directory.
//!
//! ```text
//! <base>/<run_id>/
//!   checkpoint.json
//!   step_results/<step>.json
//!   reports/summary.json
//!   reports/metrics.json
//!   reports/metrics.prom
//!   reports/events.jsonl
//!   reports/steps/<step>.json
//!   logs/pipeline.log
//!   logs/steps/<step>.log
//!   logs/steps/<step>.output.log
//! ```

use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// Paths of every file that belongs to one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    root: PathBuf,
}

impl RunLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn checkpoint(&self) -> PathBuf {
        self.root.join(CHECKPOINT_FILE)
    }

    pub fn step_results_dir(&self) -> PathBuf {
        self.root.join("step_results")
    }

    pub fn step_result(&self, step: &str) -> PathBuf {
        self.step_results_dir().join(format!("{}.json", step))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.root.join("reports")
    }

    pub fn summary(&self) -> PathBuf {
        self.reports_dir().join("summary.json")
    }

    pub fn metrics(&self) -> PathBuf {
        self.reports_dir().join("metrics.json")
    }

    pub fn prometheus(&self) -> PathBuf {
        self.reports_dir().join("metrics.prom")
    }

    pub fn events(&self) -> PathBuf {
        self.reports_dir().join("events.jsonl")
    }

    pub fn step_report(&self, step: &str) -> PathBuf {
        self.reports_dir().join("steps").join(format!("{}.json", step))
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn pipeline_log(&self) -> PathBuf {
        self.logs_dir().join("pipeline.log")
    }

    pub fn step_log(&self, step: &str) -> PathBuf {
        self.logs_dir().join("steps").join(format!("{}.log", step))
    }

    /// Verbatim stdout/stderr of an external-process step.
    pub fn step_output_log(&self, step: &str) -> PathBuf {
        self.logs_dir()
            .join("steps")
            .join(format!("{}.output.log", step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let layout = RunLayout::new("/runs/r1");
        assert_eq!(layout.checkpoint(), PathBuf::from("/runs/r1/checkpoint.json"));
        assert_eq!(
            layout.step_result("outline"),
            PathBuf::from("/runs/r1/step_results/outline.json")
        );
        assert_eq!(
            layout.events(),
            PathBuf::from("/runs/r1/reports/events.jsonl")
        );
        assert_eq!(
            layout.step_log("outline"),
            PathBuf::from("/runs/r1/logs/steps/outline.log")
        );
        assert_eq!(
            layout.step_output_log("outline"),
            PathBuf::from("/runs/r1/logs/steps/outline.output.log")
        );
    }
}
