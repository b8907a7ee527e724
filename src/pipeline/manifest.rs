//! YAML pipeline manifest.
//!
//! ```yaml
//! dependency:
//!   name: content-api
//!   url: http://localhost:8000
//!   health_path: /health
//!   remediation: "Start it with `make api`"
//!
//! pipelines:
//!   course:
//!     description: Generate and publish a course
//!     params: [topic]
//!     steps:
//!       - name: outline
//!         command: ["./scripts/outline.sh", "{topic}"]
//!         produces: [course_id]
//!       - name: lessons
//!         requires: [course_id]
//!         batch:
//!           items_param: lessons
//!           command: ["./scripts/lesson.sh", "{course_id}", "{item}"]
//!           done_marker: "{run_dir}/lessons/{item}.done"
//!       - name: publish
//!         requires_dependency: true
//!         command: ["./scripts/publish.sh", "{course_id}"]
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::definition::{PipelineDefinition, PipelineRegistry, StepDefinition};
use crate::error::ManifestError;
use crate::executor::{CommandBatch, ProcessStep};
use crate::gate::{DependencyGate, DEFAULT_HEALTH_PATH};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default)]
    dependency: Option<DependencySpec>,
    #[serde(default)]
    pipelines: BTreeMap<String, PipelineSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DependencySpec {
    name: String,
    url: String,
    #[serde(default = "default_health_path")]
    health_path: String,
    #[serde(default)]
    remediation: Option<String>,
}

fn default_health_path() -> String {
    DEFAULT_HEALTH_PATH.to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PipelineSpec {
    #[serde(default)]
    description: String,
    #[serde(default)]
    params: Vec<String>,
    #[serde(default)]
    steps: Vec<StepSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StepSpec {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    command: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    requires_dependency: bool,
    #[serde(default)]
    produces: Vec<String>,
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    batch: Option<BatchSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BatchSpec {
    items_param: String,
    command: Vec<String>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    done_marker: Option<String>,
}

/// Reads and parses a manifest file.
///
/// # Errors
///
/// Returns `ManifestError` if the file cannot be read or is invalid.
pub async fn load_manifest(
    path: &Path,
    health_request_timeout: Duration,
) -> Result<PipelineRegistry, ManifestError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    parse_manifest(&contents, health_request_timeout)
}

/// Parses manifest YAML into a registry of external-process pipelines.
///
/// # Errors
///
/// Returns `ManifestError` for malformed YAML, invalid pipelines, or gated
/// steps without a declared dependency.
pub fn parse_manifest(
    yaml: &str,
    health_request_timeout: Duration,
) -> Result<PipelineRegistry, ManifestError> {
    let file: ManifestFile = serde_yaml::from_str(yaml)?;
    let mut registry = PipelineRegistry::new();

    if let Some(dep) = file.dependency {
        let mut gate = DependencyGate::new(
            dep.name,
            &dep.url,
            &dep.health_path,
            health_request_timeout,
        )?;
        if let Some(remediation) = dep.remediation {
            gate = gate.with_remediation(remediation);
        }
        registry.set_dependency(gate);
    }

    for (kind, spec) in file.pipelines {
        let pipeline = build_pipeline(&kind, spec)?;
        if pipeline.requires_dependency() && registry.dependency().is_none() {
            let step = pipeline
                .steps()
                .iter()
                .find(|step| step.requires_dependency)
                .map(|step| step.name.clone())
                .unwrap_or_default();
            return Err(ManifestError::InvalidStep {
                kind,
                step,
                reason: "requires_dependency is set but the manifest declares no dependency"
                    .to_string(),
            });
        }
        registry.register(pipeline)?;
    }

    Ok(registry)
}

fn build_pipeline(kind: &str, spec: PipelineSpec) -> Result<PipelineDefinition, ManifestError> {
    let mut pipeline = PipelineDefinition::new(kind).with_description(spec.description);
    for param in spec.params {
        pipeline = pipeline.with_param(param);
    }
    for step in spec.steps {
        pipeline = pipeline.with_step(build_step(kind, step)?);
    }
    Ok(pipeline)
}

fn build_step(kind: &str, spec: StepSpec) -> Result<StepDefinition, ManifestError> {
    let invalid = |reason: &str| ManifestError::InvalidStep {
        kind: kind.to_string(),
        step: spec.name.clone(),
        reason: reason.to_string(),
    };

    let definition = match (&spec.batch, spec.command.is_empty()) {
        (Some(_), false) => return Err(invalid("set either 'command' or 'batch', not both")),
        (None, true) => return Err(invalid("missing 'command'")),
        (Some(batch), true) => {
            if batch.command.is_empty() {
                return Err(invalid("batch has an empty 'command'"));
            }
            if !spec.env.is_empty() {
                return Err(invalid("'env' is not supported on batch steps"));
            }
            let mut handler = CommandBatch::new(batch.items_param.clone(), batch.command.clone());
            if let Some(dir) = batch.working_dir.clone().or_else(|| spec.working_dir.clone()) {
                handler = handler.with_working_dir(dir);
            }
            if let Some(marker) = batch.done_marker.clone() {
                handler = handler.with_done_marker(marker);
            }
            StepDefinition::new(spec.name.clone(), handler.into_step())
        }
        (None, false) => {
            let mut process = ProcessStep::new(spec.command.clone());
            if let Some(dir) = spec.working_dir.clone() {
                process = process.with_working_dir(dir);
            }
            for (key, value) in &spec.env {
                process = process.with_env(key.clone(), value.clone());
            }
            StepDefinition::new(spec.name.clone(), process)
        }
    };

    let mut definition = definition
        .with_description(spec.description)
        .produces(spec.produces)
        .requires(spec.requires);
    if spec.requires_dependency {
        definition = definition.requiring_dependency();
    }
    Ok(definition)
}
