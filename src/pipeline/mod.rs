//! Pipeline kinds and the orchestrator that runs them.
//!
//! - [`definition`]: pipeline kinds as ordered lists of steps
//! - [`manifest`]: loading pipeline kinds from YAML
//! - [`config`]: orchestrator configuration (defaults, env, builder)
//! - [`orchestrator`]: the checkpointed run loop
//!
//! # Example
//!
//! ```rust,ignore
//! use stepforge::executor::{handler_fn, HandlerError, InProcessStep, ProcessStep, StepOutput};
//! use stepforge::pipeline::{
//!     Orchestrator, OrchestratorConfig, PipelineDefinition, PipelineRegistry, RunRequest,
//!     StepDefinition,
//! };
//!
//! let pipeline = PipelineDefinition::new("course")
//!     .with_param("topic")
//!     .with_step(
//!         StepDefinition::new(
//!             "outline",
//!             InProcessStep::new(handler_fn(|ctx| async move {
//!                 let topic = ctx.require("topic")?.to_string();
//!                 Ok::<_, HandlerError>(StepOutput::new().with_output("course_id", topic))
//!             })),
//!         )
//!         .produces(["course_id"]),
//!     )
//!     .with_step(StepDefinition::new(
//!         "render",
//!         ProcessStep::new(["./render.sh", "{course_id}"]),
//!     ));
//!
//! let mut registry = PipelineRegistry::new();
//! registry.register(pipeline)?;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::from_env()?, registry);
//! let outcome = orchestrator
//!     .run(RunRequest::new("course").with_param("topic", "ownership"))
//!     .await?;
//! println!("{} finished as {}", outcome.state.run_id, outcome.state.status);
//! ```

pub mod config;
pub mod definition;
pub mod manifest;
pub mod orchestrator;

pub use config::{ConfigError, OrchestratorConfig};
pub use definition::{PipelineDefinition, PipelineRegistry, StepDefinition};
pub use manifest::{load_manifest, parse_manifest};
pub use orchestrator::{Orchestrator, RunOutcome, RunRequest};
