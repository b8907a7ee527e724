//! Command-line interface for stepforge.
//!
//! Provides commands to run and resume pipelines, inspect and clean up runs,
//! and describe the pipeline kinds in a manifest.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli, Commands};
