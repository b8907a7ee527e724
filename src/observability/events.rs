//! Append-only JSON-lines event stream for a run.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;

/// One structured event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub run_id: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl PipelineEvent {
    pub fn new(event: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            run_id: run_id.into(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Merges every entry of a JSON object into the event fields.
    pub fn with_fields(mut self, fields: Value) -> Self {
        if let Value::Object(map) = fields {
            self.fields.extend(map);
        }
        self
    }
}

/// Writer for `reports/events.jsonl`.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event as a single line.
    pub async fn append(&self, event: &PipelineEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    /// Reads every event back, skipping lines that do not parse.
    pub async fn read_all(&self) -> std::io::Result<Vec<PipelineEvent>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = EventLog::new(temp_dir.path().join("reports").join("events.jsonl"));

        log.append(&PipelineEvent::new("run_started", "r1").with_field("pipeline", "course"))
            .await
            .expect("append");
        log.append(
            &PipelineEvent::new("step_completed", "r1")
                .with_fields(json!({"step": "outline", "success": true})),
        )
        .await
        .expect("append");

        let events = log.read_all().await.expect("read");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "run_started");
        assert_eq!(events[1].fields["step"], json!("outline"));

        let raw = std::fs::read_to_string(log.path()).expect("raw");
        let first: Value = serde_json::from_str(raw.lines().next().unwrap_or_default()).expect("json");
        assert_eq!(first["run_id"], json!("r1"));
        assert_eq!(first["pipeline"], json!("course"));
    }

    #[tokio::test]
    async fn test_missing_file_reads_empty() {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let log = EventLog::new(temp_dir.path().join("none.jsonl"));
        assert!(log.read_all().await.expect("read").is_empty());
    }
}
