//! Wiring for `agent-loop run`: turns a loaded config into a ready scheduler.
//!
//! Everything here is construction. The loop semantics live in
//! [`crate::scheduler`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, warn};

use crate::core::tokens::Cl100kTokenizer;
use crate::error::StartupError;
use crate::io::capabilities::CapabilityRegistry;
use crate::io::config::{AgentConfig, LoggingConfig, TokenizerKind};
use crate::io::executor::{AgentExecutor, CommandExecutor};
use crate::io::init::AgentPaths;
use crate::io::prompt::FilePrompt;
use crate::learning::roles::{ExecutorCurator, ExecutorReflector};
use crate::learning::{LearningAdapter, LearningSettings};
use crate::observe::context_budget::ContextBudgetTracker;
use crate::observe::multiplexer::ObservabilityMultiplexer;
use crate::orchestration::SubagentOrchestrator;
use crate::orchestration::coordination::CoordinationStore;
use crate::orchestration::runner::CommandSubagentRunner;
use crate::scheduler::{
    CancelToken, IterationScheduler, LoopOutcome, SchedulerSettings, new_run_id,
};

/// Open the multiplexer described by `[logging]`, one session per run.
pub fn build_multiplexer(
    paths: &AgentPaths,
    logging: &LoggingConfig,
    session_id: &str,
) -> Result<ObservabilityMultiplexer> {
    ObservabilityMultiplexer::builder(paths.resolve(&logging.log_dir))
        .min_level(logging.level)
        .console(logging.console)
        .file(logging.file)
        .pipe(logging.pipe)
        .session_id(session_id)
        .build()
        .context("open log sinks")
}

/// Build a scheduler for the workspace at `root`.
///
/// The config is validated again because CLI overrides are applied after
/// loading; a bad value is reported as [`StartupError::InvalidConfig`].
pub fn build_scheduler(
    root: &Path,
    cfg: &AgentConfig,
    cancel: CancelToken,
) -> Result<IterationScheduler> {
    cfg.validate()
        .map_err(|err| StartupError::InvalidConfig(format!("{err:#}")))?;
    let paths = AgentPaths::new(root);
    let prompt_path = paths.resolve(&cfg.prompt_file);
    if !prompt_path.is_file() {
        return Err(anyhow!(
            "prompt file {} not found (run `agent-loop init` first)",
            prompt_path.display()
        ));
    }

    let run_id = new_run_id();
    let mux = Arc::new(build_multiplexer(&paths, &cfg.logging, &run_id)?);
    let output_limit = cfg.executor.output_limit_bytes;
    let executor: Arc<dyn AgentExecutor> = Arc::new(CommandExecutor::new(
        cfg.executor.adapter.as_str(),
        cfg.executor.command.clone(),
        output_limit,
    ));

    let learning = if cfg.learning.enabled {
        let learner: Arc<dyn AgentExecutor> = Arc::new(CommandExecutor::new(
            "learning",
            cfg.learning_command().to_vec(),
            output_limit,
        ));
        let timeout = Duration::from_secs(cfg.learning.timeout_secs);
        LearningAdapter::new(
            LearningSettings::from_config(
                &cfg.learning,
                paths.resolve(&cfg.learning.skillbook_path),
            ),
            Box::new(ExecutorReflector::new(
                Arc::clone(&learner),
                paths.root.clone(),
                timeout,
            )),
            Box::new(ExecutorCurator::new(learner, paths.root.clone(), timeout)),
            Arc::clone(&mux),
        )?
    } else {
        LearningAdapter::disabled(Arc::clone(&mux))
    };

    let mut context = ContextBudgetTracker::new(
        &cfg.executor.adapter,
        paths.metrics_dir.clone(),
        Arc::clone(&mux),
    );
    if cfg.tokenizer == TokenizerKind::Cl100k {
        match Cl100kTokenizer::new() {
            Ok(tokenizer) => context = context.with_tokenizer(Box::new(tokenizer)),
            Err(err) => warn!(err = %format!("{err:#}"), "tokenizer unavailable, estimating tokens"),
        }
    }
    debug!(
        adapter = %cfg.executor.adapter,
        tokenizer = context.tokenizer_name(),
        limit = context.context_limit(),
        "context tracking configured"
    );

    let orchestrator = if cfg.orchestration.enabled {
        let registry =
            CapabilityRegistry::load(&paths.resolve(&cfg.orchestration.capabilities_path))?;
        info!(
            registry = %registry.source().display(),
            capabilities = registry.names().count(),
            "delegation enabled"
        );
        Some(SubagentOrchestrator::new(
            registry,
            CoordinationStore::new(paths.coordination_dir.clone()),
            Box::new(CommandSubagentRunner::new(
                cfg.subagent_command().to_vec(),
                output_limit,
            )),
            paths.root.clone(),
            Arc::clone(&mux),
        ))
    } else {
        None
    };

    let mut scheduler = IterationScheduler::new(
        SchedulerSettings::from_config(cfg),
        paths,
        Box::new(FilePrompt::new(prompt_path)),
        executor,
        learning,
        mux,
    )
    .with_run_id(run_id)
    .with_context_tracker(context)
    .with_cancel_token(cancel);
    if let Some(orchestrator) = orchestrator {
        scheduler = scheduler.with_orchestrator(orchestrator);
    }
    Ok(scheduler)
}

/// Build and run a scheduler for `root`.
pub fn run_loop(root: &Path, cfg: &AgentConfig, cancel: CancelToken) -> Result<LoopOutcome> {
    let mut scheduler = build_scheduler(root, cfg, cancel)?;
    info!(run_id = %scheduler.run_id(), root = %root.display(), "starting run");
    scheduler.run()
}
