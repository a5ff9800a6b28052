//! Self-improving agent loop.
//!
//! `agent-loop init` scaffolds `.agent/` in the current directory, `run`
//! drives the agent until the task completes or a limit is hit, and `stats`
//! reports what the last run and the skillbook look like.

use std::path::Path;

use agent_loop::core::types::LogLevel;
use agent_loop::error::OrchestrationError;
use agent_loop::exit_codes;
use agent_loop::io::checkpoint::load_checkpoint;
use agent_loop::io::config::{AgentConfig, load_config};
use agent_loop::io::init::{AgentPaths, InitOptions, init_workspace};
use agent_loop::io::iteration_log::{ExecutionMode, load_iterations};
use agent_loop::io::skillbook_store::read_skillbook;
use agent_loop::logging;
use agent_loop::scheduler::{CancelToken, LoopOutcome, StopReason};
use agent_loop::start::run_loop;
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Value, json};
use tracing::warn;

const TOP_SKILLS: usize = 5;

#[derive(Parser)]
#[command(
    name = "agent-loop",
    version,
    about = "Self-improving agent loop with skill learning and subagent delegation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.agent/` scaffolding, default config and a prompt placeholder.
    Init {
        /// Overwrite existing loop-owned files.
        #[arg(short, long)]
        force: bool,
    },
    /// Run iterations until the completion marker appears or a limit is hit.
    Run(RunArgs),
    /// Summarize the last checkpoint, its iterations and the skillbook.
    Stats {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
}

/// Overrides applied on top of `.agent/config.toml`.
#[derive(Args, Debug, Default)]
struct RunArgs {
    #[arg(long)]
    max_iterations: Option<u32>,
    #[arg(long)]
    max_runtime_secs: Option<u64>,
    /// Prompt file, relative to the current directory.
    #[arg(long)]
    prompt: Option<String>,
    /// Enable skill learning.
    #[arg(long, conflicts_with = "no_learning")]
    learning: bool,
    /// Disable skill learning.
    #[arg(long)]
    no_learning: bool,
    /// Delegate iterations to subagents.
    #[arg(long)]
    orchestrate: bool,
    /// Minimum product log level (DEBUG, INFO, WARNING, ERROR, CRITICAL).
    #[arg(long)]
    log_level: Option<LogLevel>,
    /// Stream log entries to the named pipe in the log directory.
    #[arg(long)]
    pipe: bool,
    /// Print the run summary as JSON.
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, cfg: &mut AgentConfig) {
        if let Some(max_iterations) = self.max_iterations {
            cfg.max_iterations = max_iterations;
        }
        if let Some(max_runtime_secs) = self.max_runtime_secs {
            cfg.max_runtime_secs = max_runtime_secs;
        }
        if let Some(prompt) = &self.prompt {
            cfg.prompt_file.clone_from(prompt);
        }
        if self.learning {
            cfg.learning.enabled = true;
        }
        if self.no_learning {
            cfg.learning.enabled = false;
        }
        if self.orchestrate {
            cfg.orchestration.enabled = true;
        }
        if let Some(level) = self.log_level {
            cfg.logging.level = level;
        }
        if self.pipe {
            cfg.logging.pipe = true;
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let root = std::env::current_dir().context("resolve current directory")?;
    match cli.command {
        Command::Init { force } => cmd_init(&root, force),
        Command::Run(args) => cmd_run(&root, &args),
        Command::Stats { json } => cmd_stats(&root, json),
    }
}

fn cmd_init(root: &Path, force: bool) -> Result<i32> {
    let paths = init_workspace(root, &InitOptions { force })?;
    println!("initialized {}", paths.agent_dir.display());
    Ok(exit_codes::OK)
}

fn cmd_run(root: &Path, args: &RunArgs) -> Result<i32> {
    let paths = AgentPaths::new(root);
    let mut cfg = load_config(&paths.config_path)?;
    args.apply(&mut cfg);

    let cancel = CancelToken::new();
    install_interrupt_handler(&cancel);
    match run_loop(root, &cfg, cancel) {
        Ok(outcome) => {
            print_outcome(&outcome, args.json)?;
            Ok(exit_code_for(outcome.stop_reason))
        }
        Err(err) => {
            if err.downcast_ref::<OrchestrationError>().is_some() {
                eprintln!("{:#}", err);
                return Ok(exit_codes::CAPABILITY);
            }
            Err(err)
        }
    }
}

fn exit_code_for(stop_reason: StopReason) -> i32 {
    match stop_reason {
        StopReason::Completed | StopReason::MaxIterations | StopReason::MaxRuntime => {
            exit_codes::OK
        }
        StopReason::FailureThreshold => exit_codes::FAILED,
        StopReason::Cancelled => exit_codes::CANCELLED,
    }
}

fn print_outcome(outcome: &LoopOutcome, json: bool) -> Result<()> {
    if json {
        let payload = serde_json::to_string_pretty(outcome).context("serialize run summary")?;
        println!("{payload}");
        return Ok(());
    }
    println!(
        "run {}: {} after {} iteration(s) ({} succeeded, {} failed)",
        outcome.run_id,
        outcome.stop_reason,
        outcome.iterations,
        outcome.successes,
        outcome.failures
    );
    println!(
        "tool calls: {} ({} failed, {}ms)",
        outcome.tool_summary.total_calls,
        outcome.tool_summary.failed,
        outcome.tool_summary.total_duration_ms
    );
    if let Some(context) = &outcome.context_summary {
        println!(
            "context: peak {:.1}% of {} tokens ({})",
            context.peak_usage_percent, context.context_limit, context.adapter
        );
    }
    Ok(())
}

fn cmd_stats(root: &Path, json: bool) -> Result<i32> {
    let paths = AgentPaths::new(root);
    let cfg = load_config(&paths.config_path)?;
    let report = stats_report(&paths, &cfg)?;
    if json {
        let payload = serde_json::to_string_pretty(&report).context("serialize stats")?;
        println!("{payload}");
        return Ok(exit_codes::OK);
    }

    match report["checkpoint"]["run_id"].as_str() {
        Some(run_id) => println!(
            "last run {run_id}: {} iteration(s) recorded, {} succeeded, {} delegated",
            report["iterations"]["recorded"],
            report["iterations"]["successes"],
            report["iterations"]["delegated"]
        ),
        None => println!("no run recorded yet"),
    }
    let learning = &report["learning"];
    if learning["enabled"].as_bool().unwrap_or(false) {
        println!(
            "skillbook {}: {} skill(s)",
            learning["skillbook_path"].as_str().unwrap_or_default(),
            learning["skill_count"]
        );
        for skill in learning["top_skills"].as_array().into_iter().flatten() {
            println!(
                "  {} (+{}/-{}) {}",
                skill["id"].as_str().unwrap_or_default(),
                skill["helpful"],
                skill["harmful"],
                skill["content"].as_str().unwrap_or_default()
            );
        }
    } else {
        println!("learning disabled");
    }
    Ok(exit_codes::OK)
}

fn stats_report(paths: &AgentPaths, cfg: &AgentConfig) -> Result<Value> {
    let checkpoint = load_checkpoint(&paths.checkpoint_path)?;
    let records = match checkpoint.as_ref().and_then(|cp| cp.run_id.as_deref()) {
        Some(run_id) => load_iterations(&paths.iterations_dir, run_id)?,
        None => Vec::new(),
    };
    let iterations = json!({
        "recorded": records.len(),
        "successes": records.iter().filter(|r| r.success).count(),
        "failures": records.iter().filter(|r| !r.success).count(),
        "delegated": records.iter().filter(|r| r.mode == ExecutionMode::Delegated).count(),
    });

    let learning = if cfg.learning.enabled {
        let path = paths.resolve(&cfg.learning.skillbook_path);
        let book = read_skillbook(&path)?.unwrap_or_default();
        let top: Vec<Value> = book
            .top_skills(TOP_SKILLS)
            .into_iter()
            .map(|skill| {
                json!({
                    "id": skill.id,
                    "content": skill.content,
                    "helpful": skill.helpful,
                    "harmful": skill.harmful,
                })
            })
            .collect();
        json!({
            "enabled": true,
            "skillbook_path": path.display().to_string(),
            "skill_count": book.len(),
            "max_skills": cfg.learning.max_skills,
            "top_skills": top,
        })
    } else {
        json!({ "enabled": false })
    };

    Ok(json!({
        "checkpoint": checkpoint,
        "iterations": iterations,
        "learning": learning,
    }))
}

/// Route Ctrl-C to `cancel`; the loop stops after the current iteration.
fn install_interrupt_handler(cancel: &CancelToken) {
    let cancel = cancel.clone();
    if let Err(err) = ctrlc::set_handler(move || cancel.cancel()) {
        warn!(err = %err, "could not install Ctrl-C handler");
    }
}
