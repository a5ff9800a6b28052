//! Subagent process runners.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::core::types::SubagentType;
use crate::io::process::{command_from_argv, run_command_with_timeout};

/// One delegated unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubagentTask {
    pub kind: SubagentType,
    pub id: String,
    pub prompt: String,
    pub required_capabilities: Vec<String>,
    pub timeout: Duration,
    pub workdir: PathBuf,
}

/// Raw outcome of running a subagent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubagentRun {
    pub stdout: String,
    pub stderr: String,
    /// Process exited with status 0.
    pub exit_success: bool,
    pub timed_out: bool,
    pub error: Option<String>,
}

/// Executes subagent tasks.
///
/// `Err` means the subagent could not be started; a subagent that ran and
/// failed is an `Ok` run with `exit_success == false`.
pub trait SubagentRunner: Send + Sync {
    fn run(&self, task: &SubagentTask) -> Result<SubagentRun>;
}

/// Runs each subagent as a command with the prompt on stdin. The process is
/// killed when the task timeout expires.
#[derive(Debug, Clone)]
pub struct CommandSubagentRunner {
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandSubagentRunner {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            command,
            output_limit_bytes,
        }
    }
}

impl SubagentRunner for CommandSubagentRunner {
    #[instrument(skip_all, fields(kind = %task.kind, id = %task.id, timeout_secs = task.timeout.as_secs()))]
    fn run(&self, task: &SubagentTask) -> Result<SubagentRun> {
        let mut cmd = command_from_argv(&self.command, &task.workdir)?;
        cmd.env("AGENT_SUBAGENT_TYPE", task.kind.as_str())
            .env("AGENT_SUBAGENT_ID", &task.id)
            .env(
                "AGENT_REQUIRED_CAPABILITIES",
                task.required_capabilities.join(","),
            );
        let output = run_command_with_timeout(
            cmd,
            Some(task.prompt.as_bytes()),
            task.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} subagent", task.kind))?;
        debug!(
            elapsed_ms = output.elapsed.as_millis() as u64,
            timed_out = output.timed_out,
            "subagent exited"
        );
        Ok(SubagentRun {
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            exit_success: output.success(),
            timed_out: output.timed_out,
            error: output.failure_reason(),
        })
    }
}
