//! External-process step strategy.
//!
//! Runs a command with the parent environment plus a few `PIPELINE_*`
//! variables, appending its combined stdout/stderr verbatim to the step's
//! output log. Exit code 0 is success. A process step may publish outputs by
//! writing a JSON object to the file named in `PIPELINE_OUTPUT_FILE`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{StepContext, StepExecutor, StepFailure, StepResult};
use crate::state::{StepMetrics, StepOutputs};

/// Environment variable naming the JSON file a process may write outputs to.
pub const OUTPUT_FILE_ENV: &str = "PIPELINE_OUTPUT_FILE";

/// A step that runs one external command.
#[derive(Debug, Clone)]
pub struct ProcessStep {
    /// Program followed by arguments; each entry is a placeholder template.
    command: Vec<String>,
    working_dir: Option<String>,
    env: Vec<(String, String)>,
}

impl ProcessStep {
    /// Creates a step running `command` (program first).
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    /// Runs the command from `dir` (a template) instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }
}

#[async_trait]
impl StepExecutor for ProcessStep {
    fn strategy(&self) -> &'static str {
        "process"
    }

    async fn execute(&self, ctx: &StepContext) -> StepResult {
        let invocation = match CommandInvocation::render(
            ctx,
            &self.command,
            self.working_dir.as_deref(),
            &self.env,
            &[],
        ) {
            Ok(invocation) => invocation,
            Err(failure) => return StepResult::failed(failure),
        };

        let output_file = ctx.layout.step_results_dir().join(format!("{}.process.json", ctx.step));
        let _ = tokio::fs::remove_file(&output_file).await;
        let log_path = ctx.layout.step_output_log(&ctx.step);

        let exit_code = match invocation.run(ctx, &log_path, Some(&output_file)).await {
            Ok(code) => code,
            Err(failure) => return StepResult::failed(failure),
        };

        let mut outputs = StepOutputs::new();
        outputs.insert("exit_code".to_string(), Value::from(exit_code));
        outputs.insert(
            "log_file".to_string(),
            Value::String(log_path.display().to_string()),
        );

        if exit_code != 0 {
            return StepResult::failed(StepFailure::ExecutionFailed(format!(
                "exit code {}",
                exit_code
            )))
            .with_outputs(outputs);
        }

        match read_output_file(&output_file).await {
            Ok(Some(published)) => outputs.extend(published),
            Ok(None) => {}
            Err(failure) => return StepResult::failed(failure).with_outputs(outputs),
        }

        StepResult::success(outputs, StepMetrics::default())
    }
}

/// A fully rendered command ready to spawn.
#[derive(Debug, Clone)]
pub(crate) struct CommandInvocation {
    pub argv: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl CommandInvocation {
    /// Renders every template against the step context.
    pub fn render(
        ctx: &StepContext,
        command: &[String],
        working_dir: Option<&str>,
        env: &[(String, String)],
        extra: &[(&str, &str)],
    ) -> Result<Self, StepFailure> {
        if command.is_empty() {
            return Err(StepFailure::PreconditionFailed(
                "step has an empty command".to_string(),
            ));
        }

        let argv = command
            .iter()
            .map(|part| ctx.render(part, extra))
            .collect::<Result<Vec<_>, _>>()?;
        let working_dir = working_dir
            .map(|dir| ctx.render(dir, extra).map(PathBuf::from))
            .transpose()?;
        let env = env
            .iter()
            .map(|(k, v)| ctx.render(v, extra).map(|v| (k.clone(), v)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            argv,
            working_dir,
            env,
        })
    }

    /// Spawns the command and waits for it, appending combined output to
    /// `log_path`. Returns the exit code.
    pub async fn run(
        &self,
        ctx: &StepContext,
        log_path: &Path,
        output_file: Option<&Path>,
    ) -> Result<i32, StepFailure> {
        let (stdout, stderr) = open_log(log_path, &self.argv).map_err(|e| {
            StepFailure::PreconditionFailed(format!(
                "failed to open output log {}: {}",
                log_path.display(),
                e
            ))
        })?;

        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .env("PIPELINE_RUN_ID", &ctx.run_id)
            .env("PIPELINE_STEP", &ctx.step)
            .env("PIPELINE_RUN_DIR", ctx.layout.root())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        if let Some(file) = output_file {
            if let Some(parent) = file.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            cmd.env(OUTPUT_FILE_ENV, file);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        info!(
            step = %ctx.step,
            program = %self.argv[0],
            args = ?&self.argv[1..],
            "Starting process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            StepFailure::PreconditionFailed(format!("failed to spawn '{}': {}", self.argv[0], e))
        })?;

        let status = child.wait().await.map_err(|e| {
            StepFailure::ExecutionFailed(format!("failed waiting for '{}': {}", self.argv[0], e))
        })?;

        match status.code() {
            Some(code) => {
                debug!(step = %ctx.step, exit_code = code, "Process exited");
                Ok(code)
            }
            None => Err(StepFailure::ExecutionFailed(format!(
                "'{}' was terminated by a signal",
                self.argv[0]
            ))),
        }
    }
}

/// Opens the log in append mode and returns handles for stdout and stderr.
fn open_log(path: &Path, argv: &[String]) -> std::io::Result<(Stdio, Stdio)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "$ {}", argv.join(" "))?;
    let stderr = file.try_clone()?;
    Ok((Stdio::from(file), Stdio::from(stderr)))
}

/// Reads outputs published by the process, if it wrote any.
async fn read_output_file(path: &Path) -> Result<Option<StepOutputs>, StepFailure> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StepFailure::ExecutionFailed(format!(
                "failed to read published outputs: {}",
                e
            )))
        }
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) => Err(StepFailure::ExecutionFailed(format!(
            "published outputs in {} must be a JSON object",
            path.display()
        ))),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid published outputs");
            Err(StepFailure::ExecutionFailed(format!(
                "published outputs in {} are not valid JSON: {}",
                path.display(),
                e
            )))
        }
    }
}
