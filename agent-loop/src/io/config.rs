//! Loop configuration stored under `.agent/config.toml`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::LogLevel;
use crate::io::atomic::write_atomic;

/// Agent loop configuration (TOML).
///
/// Meant to be edited by humans. Missing fields fall back to defaults, so an
/// empty file is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard cap on iterations per run.
    pub max_iterations: u32,

    /// Wall-clock budget for the whole run, in seconds.
    pub max_runtime_secs: u64,

    /// Per-iteration executor timeout, in seconds.
    pub iteration_timeout_secs: u64,

    /// Executor output containing this string ends the run as completed.
    pub completion_marker: String,

    /// Stop after this many failed iterations in a row. `0` disables the limit.
    pub max_consecutive_failures: u32,

    /// Persist skillbook and checkpoint every N iterations. `0` means only at
    /// shutdown.
    pub checkpoint_interval: u32,

    /// Prompt file, re-read at the start of every iteration.
    pub prompt_file: String,

    /// Token counting strategy for context tracking.
    pub tokenizer: TokenizerKind,

    pub executor: ExecutorConfig,
    pub learning: LearningConfig,
    pub logging: LoggingConfig,
    pub orchestration: OrchestrationConfig,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TokenizerKind {
    /// Four characters per token.
    #[default]
    Heuristic,
    /// Exact `cl100k_base` BPE counts, heuristic if the encoding fails to load.
    Cl100k,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Adapter name; selects the context window limit.
    pub adapter: String,

    /// Command that receives the prompt on stdin (e.g. `["claude","-p"]`).
    pub command: Vec<String>,

    /// Truncate executor stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            adapter: "claude".to_string(),
            command: vec!["claude".to_string(), "-p".to_string()],
            output_limit_bytes: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,

    /// Model label recorded in stats and passed to reflection prompts.
    pub model: String,

    /// Skillbook location, relative to the workspace root.
    pub skillbook_path: String,

    /// Run reflection on a background worker instead of inline.
    pub async_learning: bool,

    pub max_skills: usize,

    /// Pending learning jobs before the loop blocks on submit.
    pub queue_capacity: usize,

    /// Command used for reflection prompts. Empty reuses `executor.command`.
    pub command: Vec<String>,

    /// Timeout for one reflection or curation call, in seconds.
    pub timeout_secs: u64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: "claude".to_string(),
            skillbook_path: ".agent/skillbook/skillbook.json".to_string(),
            async_learning: true,
            max_skills: 100,
            queue_capacity: 16,
            command: Vec::new(),
            timeout_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum level written to any sink.
    pub level: LogLevel,
    pub console: bool,
    pub file: bool,
    /// Stream entries to a named pipe in `log_dir`.
    pub pipe: bool,
    pub log_dir: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            console: true,
            file: true,
            pipe: false,
            log_dir: ".agent/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnCapabilityError {
    /// Persist state and stop the run.
    #[default]
    Abort,
    /// Warn and run the iteration through the executor directly.
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestrationConfig {
    pub enabled: bool,

    /// JSON file with an `mcpServers` map describing available capabilities.
    pub capabilities_path: String,

    /// Command that runs one subagent. Empty reuses `executor.command`.
    pub subagent_command: Vec<String>,

    /// Lower bound for a subagent's share of the remaining run budget.
    pub min_subagent_timeout_secs: u64,

    pub on_capability_error: OnCapabilityError,
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            capabilities_path: ".mcp.json".to_string(),
            subagent_command: Vec::new(),
            min_subagent_timeout_secs: 30,
            on_capability_error: OnCapabilityError::Abort,
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_runtime_secs: 4 * 60 * 60,
            iteration_timeout_secs: 30 * 60,
            completion_marker: "LOOP_COMPLETE".to_string(),
            max_consecutive_failures: 5,
            checkpoint_interval: 5,
            prompt_file: "PROMPT.md".to_string(),
            tokenizer: TokenizerKind::Heuristic,
            executor: ExecutorConfig::default(),
            learning: LearningConfig::default(),
            logging: LoggingConfig::default(),
            orchestration: OrchestrationConfig::default(),
        }
    }
}

fn validate_command(label: &str, command: &[String], allow_empty: bool) -> Result<()> {
    match command.first() {
        None if allow_empty => Ok(()),
        Some(program) if !program.trim().is_empty() => Ok(()),
        _ => Err(anyhow!("{label} must be a non-empty array")),
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_runtime_secs == 0 {
            return Err(anyhow!("max_runtime_secs must be > 0"));
        }
        if self.iteration_timeout_secs == 0 {
            return Err(anyhow!("iteration_timeout_secs must be > 0"));
        }
        if self.completion_marker.trim().is_empty() {
            return Err(anyhow!("completion_marker must not be empty"));
        }
        if self.prompt_file.trim().is_empty() {
            return Err(anyhow!("prompt_file must not be empty"));
        }
        if self.executor.output_limit_bytes == 0 {
            return Err(anyhow!("executor.output_limit_bytes must be > 0"));
        }
        validate_command("executor.command", &self.executor.command, false)?;
        if self.learning.max_skills == 0 {
            return Err(anyhow!("learning.max_skills must be > 0"));
        }
        if self.learning.queue_capacity == 0 {
            return Err(anyhow!("learning.queue_capacity must be > 0"));
        }
        if self.learning.timeout_secs == 0 {
            return Err(anyhow!("learning.timeout_secs must be > 0"));
        }
        if self.learning.skillbook_path.trim().is_empty() {
            return Err(anyhow!("learning.skillbook_path must not be empty"));
        }
        validate_command("learning.command", &self.learning.command, true)?;
        if self.logging.log_dir.trim().is_empty() {
            return Err(anyhow!("logging.log_dir must not be empty"));
        }
        validate_command(
            "orchestration.subagent_command",
            &self.orchestration.subagent_command,
            true,
        )?;
        if self.orchestration.min_subagent_timeout_secs == 0 {
            return Err(anyhow!(
                "orchestration.min_subagent_timeout_secs must be > 0"
            ));
        }
        Ok(())
    }

    /// Command for reflection prompts.
    pub fn learning_command(&self) -> &[String] {
        if self.learning.command.is_empty() {
            &self.executor.command
        } else {
            &self.learning.command
        }
    }

    /// Command for subagent runs.
    pub fn subagent_command(&self) -> &[String] {
        if self.orchestration.subagent_command.is_empty() {
            &self.executor.command
        } else {
            &self.orchestration.subagent_command
        }
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, AgentConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = AgentConfig::default();
        cfg.learning.enabled = true;
        cfg.orchestration.on_capability_error = OnCapabilityError::Direct;
        cfg.logging.level = LogLevel::Debug;
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_iterations = 7\n\n[learning]\nenabled = true\n\n[logging]\nlevel = \"warning\"\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_iterations, 7);
        assert!(cfg.learning.enabled);
        assert_eq!(cfg.learning.max_skills, 100);
        assert_eq!(cfg.logging.level, LogLevel::Warn);
        assert_eq!(cfg.orchestration.min_subagent_timeout_secs, 30);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[executor]\ncommand = []\n").expect("write");
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("executor.command"));
    }

    #[test]
    fn empty_role_commands_fall_back_to_executor() {
        let mut cfg = AgentConfig::default();
        assert_eq!(cfg.learning_command(), cfg.executor.command.as_slice());
        cfg.orchestration.subagent_command = vec!["sub".to_string()];
        assert_eq!(cfg.subagent_command(), ["sub".to_string()]);
    }
}
