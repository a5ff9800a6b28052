//! Agent executor abstraction.
//!
//! The [`AgentExecutor`] trait decouples the loop from the actual agent
//! backend. The shipped [`CommandExecutor`] pipes the prompt into a
//! configured command; tests use scripted executors that return canned
//! outcomes without spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{Value, json};
use tracing::{debug, info, instrument, warn};

use crate::core::text::last_json_object;
use crate::io::process::{command_from_argv, run_command_with_timeout};
use crate::observe::tool_calls::ToolCallTracker;

/// Parameters for one executor invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    /// Working directory for the agent.
    pub workdir: PathBuf,
    /// Full prompt, including any injected context.
    pub prompt: String,
    /// Iteration number, `0` outside the loop (learning prompts).
    pub iteration: u32,
    /// Maximum time to wait for the agent.
    pub timeout: Duration,
}

/// Per-call collaborators an executor may report into.
#[derive(Clone, Copy, Default)]
pub struct ExecContext<'a> {
    pub tools: Option<&'a ToolCallTracker>,
}

/// Result of one agent run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutcome {
    pub success: bool,
    pub output: String,
    /// Tokens reported by the backend, when it reports any.
    pub tokens_used: Option<u64>,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn succeeded(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            ..Self::default()
        }
    }

    pub fn failed(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Abstraction over agent backends.
///
/// `Err` is reserved for infrastructure failures (the agent could not be
/// started at all). An agent that ran and failed returns `Ok` with
/// `success == false`.
pub trait AgentExecutor: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, request: &ExecRequest, ctx: &ExecContext<'_>) -> Result<ExecOutcome>;
}

/// Executor that spawns a command and writes the prompt to its stdin.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    name: String,
    command: Vec<String>,
    output_limit_bytes: usize,
}

impl CommandExecutor {
    pub fn new(name: impl Into<String>, command: Vec<String>, output_limit_bytes: usize) -> Self {
        Self {
            name: name.into(),
            command,
            output_limit_bytes,
        }
    }
}

impl AgentExecutor for CommandExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(executor = %self.name, iteration = request.iteration, timeout_secs = request.timeout.as_secs()))]
    fn execute(&self, request: &ExecRequest, ctx: &ExecContext<'_>) -> Result<ExecOutcome> {
        info!(workdir = %request.workdir.display(), "starting agent command");
        let cmd = command_from_argv(&self.command, &request.workdir)?;

        let handle = ctx.tools.map(|tools| {
            tools.start_call(
                &self.name,
                json!({
                    "command": self.command,
                    "prompt_chars": request.prompt.chars().count(),
                }),
            )
        });

        let run = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} command", self.name));

        let output = match run {
            Ok(output) => output,
            Err(err) => {
                if let (Some(tools), Some(handle)) = (ctx.tools, handle) {
                    tools.end_call(handle, None, false, Some(&format!("{err:#}")));
                }
                return Err(err);
            }
        };

        let failure = output.failure_reason();
        if let (Some(tools), Some(handle)) = (ctx.tools, handle) {
            let summary = format!(
                "{} bytes stdout, {} bytes stderr",
                output.stdout.len(),
                output.stderr.len()
            );
            tools.end_call(handle, Some(&summary), failure.is_none(), failure.as_deref());
        }

        let mut text = output.stdout_text();
        let tokens_used = reported_tokens(&text);
        if output.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[{} stdout truncated {} bytes]\n",
                self.name, output.stdout_truncated
            ));
        }

        match failure {
            None => {
                debug!(tokens_used = ?tokens_used, "agent command completed");
                Ok(ExecOutcome {
                    tokens_used,
                    ..ExecOutcome::succeeded(text)
                })
            }
            Some(reason) => {
                warn!(reason = %reason, "agent command failed");
                let stderr = output.stderr_text();
                let error = if stderr.trim().is_empty() {
                    reason
                } else {
                    format!("{reason}: {}", stderr.trim())
                };
                Ok(ExecOutcome {
                    tokens_used,
                    timed_out: output.timed_out,
                    ..ExecOutcome::failed(text, error)
                })
            }
        }
    }
}

/// Token usage from the agent's final JSON report: `usage.total_tokens`,
/// else `usage.input_tokens + usage.output_tokens`, else `tokens_used`.
fn reported_tokens(output: &str) -> Option<u64> {
    let report = last_json_object(output)?;
    if let Some(usage) = report.get("usage").and_then(Value::as_object) {
        if let Some(total) = usage.get("total_tokens").and_then(Value::as_u64) {
            return Some(total);
        }
        let input = usage.get("input_tokens").and_then(Value::as_u64);
        let output = usage.get("output_tokens").and_then(Value::as_u64);
        if input.is_some() || output.is_some() {
            return Some(input.unwrap_or(0) + output.unwrap_or(0));
        }
    }
    report.get("tokens_used").and_then(Value::as_u64)
}
