//! Pipeline kinds and their fixed step sequences.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::{ManifestError, OrchestratorError};
use crate::executor::StepExecutor;
use crate::gate::DependencyGate;

/// One named step of a pipeline.
#[derive(Clone)]
pub struct StepDefinition {
    pub name: String,
    pub description: String,
    /// Wait for the registry's dependency gate before running.
    pub requires_dependency: bool,
    /// Output keys captured into the run's identifiers on success.
    pub produces: Vec<String>,
    /// Keys that must be known before the step may start.
    pub requires: Vec<String>,
    executor: Arc<dyn StepExecutor>,
}

impl StepDefinition {
    pub fn new(name: impl Into<String>, executor: impl StepExecutor + 'static) -> Self {
        Self::from_arc(name, Arc::new(executor))
    }

    pub fn from_arc(name: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            requires_dependency: false,
            produces: Vec::new(),
            requires: Vec::new(),
            executor,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Marks the step as gated on the external dependency.
    pub fn requiring_dependency(mut self) -> Self {
        self.requires_dependency = true;
        self
    }

    pub fn produces<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.produces.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn requires<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn executor(&self) -> &dyn StepExecutor {
        self.executor.as_ref()
    }
}

impl std::fmt::Debug for StepDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepDefinition")
            .field("name", &self.name)
            .field("strategy", &self.executor.strategy())
            .field("requires_dependency", &self.requires_dependency)
            .field("produces", &self.produces)
            .field("requires", &self.requires)
            .finish()
    }
}

/// A pipeline kind: required parameters plus an ordered list of steps.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub kind: String,
    pub description: String,
    /// Parameters a new run must supply.
    pub params: Vec<String>,
    steps: Vec<StepDefinition>,
}

impl PipelineDefinition {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            description: String::new(),
            params: Vec::new(),
            steps: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_param(mut self, name: impl Into<String>) -> Self {
        self.params.push(name.into());
        self
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn step(&self, name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|step| step.name == name)
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn requires_dependency(&self) -> bool {
        self.steps.iter().any(|step| step.requires_dependency)
    }

    /// Checks the definition is runnable: at least one step, unique step
    /// names, and names usable as file names.
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_name(&self.kind) {
            return Err(ManifestError::InvalidPipeline {
                kind: self.kind.clone(),
                reason: "kind may only contain letters, digits, '-' and '_'".to_string(),
            });
        }
        if self.steps.is_empty() {
            return Err(ManifestError::InvalidPipeline {
                kind: self.kind.clone(),
                reason: "pipeline has no steps".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !is_valid_name(&step.name) {
                return Err(ManifestError::InvalidStep {
                    kind: self.kind.clone(),
                    step: step.name.clone(),
                    reason: "name may only contain letters, digits, '-' and '_'".to_string(),
                });
            }
            if !seen.insert(step.name.as_str()) {
                return Err(ManifestError::InvalidStep {
                    kind: self.kind.clone(),
                    step: step.name.clone(),
                    reason: "duplicate step name".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Checks that every required parameter is present and non-empty.
    pub fn check_parameters(
        &self,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), OrchestratorError> {
        let missing: Vec<&str> = self
            .params
            .iter()
            .filter(|name| parameters.get(*name).map_or(true, |v| v.trim().is_empty()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(OrchestratorError::Validation(format!(
                "pipeline '{}' requires parameter(s): {}",
                self.kind,
                missing.join(", ")
            )))
        }
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Every pipeline kind known to an orchestrator, plus the dependency gated
/// steps wait on.
#[derive(Debug, Clone, Default)]
pub struct PipelineRegistry {
    pipelines: BTreeMap<String, PipelineDefinition>,
    dependency: Option<DependencyGate>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a pipeline kind.
    ///
    /// # Errors
    ///
    /// Returns `ManifestError` if the definition is invalid or its kind is
    /// already registered.
    pub fn register(&mut self, pipeline: PipelineDefinition) -> Result<(), ManifestError> {
        pipeline.validate()?;
        if self.pipelines.contains_key(&pipeline.kind) {
            return Err(ManifestError::InvalidPipeline {
                kind: pipeline.kind.clone(),
                reason: "kind is already registered".to_string(),
            });
        }
        self.pipelines.insert(pipeline.kind.clone(), pipeline);
        Ok(())
    }

    pub fn with_dependency(mut self, gate: DependencyGate) -> Self {
        self.dependency = Some(gate);
        self
    }

    pub fn set_dependency(&mut self, gate: DependencyGate) {
        self.dependency = Some(gate);
    }

    pub fn dependency(&self) -> Option<&DependencyGate> {
        self.dependency.as_ref()
    }

    pub fn get(&self, kind: &str) -> Option<&PipelineDefinition> {
        self.pipelines.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.pipelines.keys().map(String::as_str)
    }

    pub fn pipelines(&self) -> impl Iterator<Item = &PipelineDefinition> {
        self.pipelines.values()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
