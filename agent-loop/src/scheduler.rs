//! The iteration loop behind `agent-loop run`.
//!
//! Each cycle loads the prompt, injects learned strategies, runs the agent
//! (directly or through a subagent), feeds the outcome back into learning and
//! records the iteration. State is persisted at every checkpoint interval and
//! on every way out of the loop, fatal errors included.

use std::cell::Cell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Local, Utc};
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::core::budget::proportional_timeout;
use crate::core::text::checklist_items;
use crate::core::types::{LogLevel, MeasurePoint, SubagentType, Verdict};
use crate::error::OrchestrationError;
use crate::io::checkpoint::{Checkpoint, write_checkpoint};
use crate::io::config::{AgentConfig, OnCapabilityError};
use crate::io::executor::{AgentExecutor, ExecContext, ExecRequest};
use crate::io::init::AgentPaths;
use crate::io::iteration_log::{ExecutionMode, IterationRecord, write_iteration};
use crate::io::prompt::PromptSource;
use crate::learning::LearningAdapter;
use crate::observe::context_budget::{ContextBudgetTracker, ContextSummary};
use crate::observe::entry::LogEntry;
use crate::observe::multiplexer::ObservabilityMultiplexer;
use crate::observe::tool_calls::{ToolCallSummary, ToolCallTracker};
use crate::orchestration::SubagentOrchestrator;

const COMPONENT: &str = "Scheduler";

/// Where the loop currently is. Transitions are logged at DEBUG.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Preparing,
    Executing,
    Reflecting,
    Checkpointing,
    Terminated,
}

impl LoopState {
    pub fn as_str(self) -> &'static str {
        match self {
            LoopState::Idle => "idle",
            LoopState::Preparing => "preparing",
            LoopState::Executing => "executing",
            LoopState::Reflecting => "reflecting",
            LoopState::Checkpointing => "checkpointing",
            LoopState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reason why [`IterationScheduler::run`] stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The agent printed the completion marker.
    Completed,
    MaxIterations,
    MaxRuntime,
    Cancelled,
    /// `max_consecutive_failures` iterations failed in a row.
    FailureThreshold,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::MaxIterations => "max_iterations",
            StopReason::MaxRuntime => "max_runtime",
            StopReason::Cancelled => "cancelled",
            StopReason::FailureThreshold => "failure_threshold",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopOutcome {
    pub run_id: String,
    pub iterations: u32,
    pub successes: u32,
    pub failures: u32,
    pub stop_reason: StopReason,
    pub tool_summary: ToolCallSummary,
    pub context_summary: Option<ContextSummary>,
}

/// Cooperative cancellation flag, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Loop limits and policies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub max_iterations: u32,
    pub max_runtime: Duration,
    pub iteration_timeout: Duration,
    pub completion_marker: String,
    /// `0` disables the limit.
    pub max_consecutive_failures: u32,
    /// `0` checkpoints only at shutdown.
    pub checkpoint_interval: u32,
    pub min_subagent_timeout: Duration,
    pub on_capability_error: OnCapabilityError,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            max_iterations: cfg.max_iterations,
            max_runtime: Duration::from_secs(cfg.max_runtime_secs),
            iteration_timeout: Duration::from_secs(cfg.iteration_timeout_secs),
            completion_marker: cfg.completion_marker.clone(),
            max_consecutive_failures: cfg.max_consecutive_failures,
            checkpoint_interval: cfg.checkpoint_interval,
            min_subagent_timeout: Duration::from_secs(cfg.orchestration.min_subagent_timeout_secs),
            on_capability_error: cfg.orchestration.on_capability_error,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from_config(&AgentConfig::default())
    }
}

/// New run id: local start time plus a short random suffix.
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Local::now().format("%Y%m%d-%H%M%S"), &suffix[..6])
}

#[derive(Debug, Default)]
struct Counters {
    iterations: u32,
    successes: u32,
    failures: u32,
    consecutive_failures: u32,
    last_success: Option<bool>,
}

/// End of the runtime budget. A budget too large to represent has no end.
#[derive(Debug, Clone, Copy)]
struct Deadline(Option<Instant>);

impl Deadline {
    fn after(budget: Duration) -> Self {
        Self(Instant::now().checked_add(budget))
    }

    fn passed(self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    fn remaining(self) -> Duration {
        self.0
            .map_or(Duration::MAX, |at| at.saturating_duration_since(Instant::now()))
    }
}

/// What one execution step produced, however it was carried out.
struct StepResult {
    success: bool,
    output: String,
    error: Option<String>,
    mode: ExecutionMode,
    subagent: Option<SubagentType>,
    verdict: Option<Verdict>,
    tokens_used: Option<u64>,
}

pub struct IterationScheduler {
    settings: SchedulerSettings,
    paths: AgentPaths,
    run_id: String,
    prompt: Box<dyn PromptSource>,
    executor: Arc<dyn AgentExecutor>,
    learning: LearningAdapter,
    orchestrator: Option<SubagentOrchestrator>,
    tools: ToolCallTracker,
    context: ContextBudgetTracker,
    mux: Arc<ObservabilityMultiplexer>,
    cancel: CancelToken,
    state: Cell<LoopState>,
}

impl IterationScheduler {
    /// Scheduler executing every iteration directly. Context is tracked
    /// against the executor's window with the character heuristic.
    pub fn new(
        settings: SchedulerSettings,
        paths: AgentPaths,
        prompt: Box<dyn PromptSource>,
        executor: Arc<dyn AgentExecutor>,
        learning: LearningAdapter,
        mux: Arc<ObservabilityMultiplexer>,
    ) -> Self {
        let context = ContextBudgetTracker::new(
            executor.name(),
            paths.metrics_dir.clone(),
            Arc::clone(&mux),
        );
        Self {
            settings,
            paths,
            run_id: new_run_id(),
            prompt,
            executor,
            learning,
            orchestrator: None,
            tools: ToolCallTracker::new(Arc::clone(&mux)),
            context,
            mux,
            cancel: CancelToken::new(),
            state: Cell::new(LoopState::Idle),
        }
    }

    /// Delegate iterations to subagents.
    pub fn with_orchestrator(mut self, orchestrator: SubagentOrchestrator) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_context_tracker(mut self, context: ContextBudgetTracker) -> Self {
        self.context = context;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> LoopState {
        self.state.get()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn learning(&self) -> &LearningAdapter {
        &self.learning
    }

    pub fn tools(&self) -> &ToolCallTracker {
        &self.tools
    }

    pub fn context(&self) -> &ContextBudgetTracker {
        &self.context
    }

    /// Run iterations until a stop condition holds.
    ///
    /// Errors end the run after state has been persisted. A missing
    /// capability under the `abort` policy surfaces as
    /// [`OrchestrationError`], recoverable with `downcast_ref`.
    #[instrument(skip_all, fields(run_id = %self.run_id, max_iterations = self.settings.max_iterations))]
    pub fn run(&mut self) -> Result<LoopOutcome> {
        let deadline = Deadline::after(self.settings.max_runtime);
        self.mux.emit(
            LogEntry::new(
                LogLevel::Info,
                COMPONENT,
                format!("run {} started", self.run_id),
            )
            .with_meta("max_iterations", self.settings.max_iterations)
            .with_meta("max_runtime_secs", self.settings.max_runtime.as_secs())
            .with_meta("delegation", self.orchestrator.is_some())
            .with_meta("learning", self.learning.is_enabled()),
        );

        let mut counters = Counters::default();
        let result = self.run_cycles(&mut counters, deadline);
        let persisted = self.shutdown(&counters);

        let stop_reason = match result {
            Ok(stop_reason) => {
                if let Err(err) = persisted {
                    self.mux.shutdown();
                    return Err(err);
                }
                stop_reason
            }
            Err(err) => {
                self.mux
                    .critical(COMPONENT, format!("run {} aborted: {err:#}", self.run_id));
                if let Err(persist_err) = persisted {
                    debug!(err = %persist_err, "persisting after a fatal error also failed");
                }
                self.mux.shutdown();
                return Err(err);
            }
        };

        let outcome = LoopOutcome {
            run_id: self.run_id.clone(),
            iterations: counters.iterations,
            successes: counters.successes,
            failures: counters.failures,
            stop_reason,
            tool_summary: self.tools.summary(),
            context_summary: self.context.summary(),
        };
        self.mux.emit(
            LogEntry::new(
                LogLevel::Info,
                COMPONENT,
                format!(
                    "run {} finished after {} iteration(s): {} ({} succeeded, {} failed)",
                    outcome.run_id,
                    outcome.iterations,
                    outcome.stop_reason,
                    outcome.successes,
                    outcome.failures
                ),
            )
            .with_meta("stop_reason", outcome.stop_reason.as_str()),
        );
        self.mux.shutdown();
        Ok(outcome)
    }

    fn transition(&self, next: LoopState) {
        let previous = self.state.replace(next);
        if previous != next {
            self.mux
                .debug(COMPONENT, format!("state {previous} -> {next}"));
        }
    }

    fn run_cycles(&self, counters: &mut Counters, deadline: Deadline) -> Result<StopReason> {
        loop {
            if self.cancel.is_cancelled() {
                self.mux.warn(COMPONENT, "cancellation requested; stopping");
                return Ok(StopReason::Cancelled);
            }
            if counters.iterations >= self.settings.max_iterations {
                return Ok(StopReason::MaxIterations);
            }
            if deadline.passed() {
                self.mux.warn(
                    COMPONENT,
                    format!(
                        "runtime budget of {}s exhausted",
                        self.settings.max_runtime.as_secs()
                    ),
                );
                return Ok(StopReason::MaxRuntime);
            }

            let iteration = counters.iterations + 1;
            let completed = self.run_iteration(iteration, deadline, counters)?;

            let interval = self.settings.checkpoint_interval;
            if interval > 0 && iteration % interval == 0 {
                self.transition(LoopState::Checkpointing);
                self.checkpoint(counters)?;
            }
            self.transition(LoopState::Idle);

            if completed {
                return Ok(StopReason::Completed);
            }
            let threshold = self.settings.max_consecutive_failures;
            if threshold > 0 && counters.consecutive_failures >= threshold {
                self.mux.error(
                    COMPONENT,
                    format!("{threshold} consecutive failures; stopping"),
                );
                return Ok(StopReason::FailureThreshold);
            }
        }
    }

    /// One full cycle. Returns whether the completion marker was seen.
    #[instrument(skip_all, fields(iteration = iteration))]
    fn run_iteration(
        &self,
        iteration: u32,
        deadline: Deadline,
        counters: &mut Counters,
    ) -> Result<bool> {
        let started_at = Utc::now();
        let started = Instant::now();
        self.transition(LoopState::Preparing);
        self.mux.emit(
            LogEntry::new(
                LogLevel::Info,
                COMPONENT,
                format!("iteration {iteration} started"),
            )
            .with_iteration(iteration),
        );

        let prompt = self
            .prompt
            .load(iteration)
            .with_context(|| format!("load prompt for iteration {iteration}"))?;
        let injected = self.learning.inject_context(&prompt);
        let skills_before = self.learning.skill_count() as i64;
        self.context.measure(
            MeasurePoint::IterationStart,
            &prompt,
            COMPONENT,
            Some(iteration),
        );
        if injected != prompt {
            self.context
                .measure(MeasurePoint::AfterSkillbookInject, &injected, "Learning", None);
        }

        self.transition(LoopState::Executing);
        let step = self.execute(iteration, &injected, deadline)?;
        let full_context = format!("{injected}\n\n{}", step.output);
        self.context
            .measure(MeasurePoint::AfterResponse, &full_context, COMPONENT, None);
        self.context
            .measure(MeasurePoint::IterationEnd, &full_context, COMPONENT, None);

        self.transition(LoopState::Reflecting);
        self.learning
            .learn_from_execution(&prompt, &step.output, step.success, step.error.as_deref());
        let learning_delta = self.learning.skill_count() as i64 - skills_before;

        let completion_detected = step.output.contains(&self.settings.completion_marker);
        counters.iterations = iteration;
        counters.last_success = Some(step.success);
        if step.success {
            counters.successes += 1;
            counters.consecutive_failures = 0;
        } else {
            counters.failures += 1;
            counters.consecutive_failures += 1;
        }

        let record = IterationRecord {
            run_id: self.run_id.clone(),
            iteration,
            started_at,
            ended_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            success: step.success,
            mode: step.mode,
            subagent: step.subagent,
            verdict: step.verdict,
            learning_delta,
            completion_detected,
            error: step.error.clone(),
        };
        write_iteration(&self.paths.iterations_dir, &record, &injected, &step.output)
            .with_context(|| format!("record iteration {iteration}"))?;

        let (level, status) = if step.success {
            (LogLevel::Info, "SUCCESS")
        } else {
            (LogLevel::Warn, "FAILED")
        };
        let mut entry = LogEntry::new(
            level,
            COMPONENT,
            format!("iteration {iteration} finished: {status}"),
        )
        .with_iteration(iteration)
        .with_meta("duration_ms", record.duration_ms)
        .with_meta("learning_delta", learning_delta);
        if let Some(tokens) = step.tokens_used {
            entry = entry.with_meta("tokens_used", tokens);
        }
        if let Some(err) = &step.error {
            entry = entry.with_meta("error", err.as_str());
        }
        self.mux.emit(entry);
        if completion_detected {
            self.mux.info(
                COMPONENT,
                format!("completion marker found in iteration {iteration}"),
            );
        }
        Ok(completion_detected)
    }

    fn execute(&self, iteration: u32, prompt: &str, deadline: Deadline) -> Result<StepResult> {
        let Some(orchestrator) = &self.orchestrator else {
            return self.execute_direct(iteration, prompt, deadline);
        };
        match self.delegate(orchestrator, iteration, prompt, deadline) {
            Ok(step) => Ok(step),
            Err(err) => match err.downcast_ref::<OrchestrationError>() {
                Some(OrchestrationError::MissingCapabilities { .. })
                    if self.settings.on_capability_error == OnCapabilityError::Direct =>
                {
                    self.mux.warn(
                        COMPONENT,
                        format!("delegation unavailable, executing directly: {err}"),
                    );
                    self.execute_direct(iteration, prompt, deadline)
                }
                _ => Err(err),
            },
        }
    }

    fn execute_direct(&self, iteration: u32, prompt: &str, deadline: Deadline) -> Result<StepResult> {
        let remaining = deadline.remaining();
        let timeout = self
            .settings
            .iteration_timeout
            .min(remaining)
            .max(Duration::from_secs(1));
        let request = ExecRequest {
            workdir: self.paths.root.clone(),
            prompt: prompt.to_string(),
            iteration,
            timeout,
        };
        let outcome = self
            .executor
            .execute(
                &request,
                &ExecContext {
                    tools: Some(&self.tools),
                },
            )
            .with_context(|| format!("execute iteration {iteration}"))?;
        let error = if outcome.success {
            None
        } else if outcome.timed_out {
            Some(
                outcome
                    .error
                    .unwrap_or_else(|| format!("timed out after {}s", timeout.as_secs())),
            )
        } else {
            Some(
                outcome
                    .error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
            )
        };
        Ok(StepResult {
            success: outcome.success,
            output: outcome.output,
            error,
            mode: ExecutionMode::Direct,
            subagent: None,
            verdict: None,
            tokens_used: outcome.tokens_used,
        })
    }

    /// Run the iteration through one classified subagent.
    fn delegate(
        &self,
        orchestrator: &SubagentOrchestrator,
        iteration: u32,
        prompt: &str,
        deadline: Deadline,
    ) -> Result<StepResult> {
        let kind = orchestrator.classify(prompt);
        orchestrator.verify_required_mcps(kind)?;

        let phase = format!("iteration {iteration}");
        let criteria = checklist_items(prompt);
        orchestrator.begin_attempt(iteration, &phase, &criteria)?;
        orchestrator.write_shared_context(&[("Task", prompt)])?;
        let subagent_prompt = format!(
            "{}\n\n---\n\n{}",
            orchestrator.generate_subagent_prompt(kind, &phase, &criteria)?,
            prompt
        );

        let remaining_runtime = deadline.remaining();
        let remaining_iterations = self.settings.max_iterations.saturating_sub(iteration) + 1;
        let timeout = proportional_timeout(
            remaining_runtime,
            remaining_iterations,
            self.settings.min_subagent_timeout,
        );
        let result =
            orchestrator.spawn_subagent(kind, &subagent_prompt, timeout, Some(&self.tools))?;
        let aggregated = orchestrator.aggregate_results()?;
        orchestrator.append_to_journal(
            iteration,
            &format!(
                "{kind} subagent {}: {}\n\n{}",
                result.subagent_id, aggregated.verdict, aggregated.summary
            ),
        )?;

        let success = aggregated.verdict == Verdict::Pass;
        let error = (!success).then(|| {
            result
                .error
                .clone()
                .unwrap_or_else(|| aggregated.summary.clone())
        });
        let output = aggregated
            .results
            .iter()
            .map(|result| result.stdout.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(StepResult {
            success,
            output,
            error,
            mode: ExecutionMode::Delegated,
            subagent: Some(kind),
            verdict: Some(aggregated.verdict),
            tokens_used: None,
        })
    }

    /// Join learning, save the skillbook and write the checkpoint.
    fn checkpoint(&self, counters: &Counters) -> Result<()> {
        self.learning
            .save_skillbook()
            .context("save skillbook at checkpoint")?;
        write_checkpoint(&self.paths.checkpoint_path, &self.checkpoint_state(counters))?;
        debug!(iteration = counters.iterations, "checkpoint written");
        Ok(())
    }

    fn checkpoint_state(&self, counters: &Counters) -> Checkpoint {
        Checkpoint {
            run_id: Some(self.run_id.clone()),
            next_iteration: counters.iterations + 1,
            successes: counters.successes,
            failures: counters.failures,
            consecutive_failures: counters.consecutive_failures,
            last_success: counters.last_success,
            updated_at: Some(Utc::now()),
        }
    }

    /// Persist everything. Every step runs even when an earlier one fails;
    /// the first failure is returned.
    fn shutdown(&mut self, counters: &Counters) -> Result<()> {
        self.transition(LoopState::Terminated);
        let skillbook = self
            .learning
            .save_skillbook()
            .context("save skillbook at shutdown");
        self.learning.shutdown();
        let checkpoint = write_checkpoint(&self.paths.checkpoint_path, &self.checkpoint_state(counters));
        let timeline = if self.context.measurements().is_empty() {
            Ok(())
        } else {
            self.context
                .save_timeline(Some(&format!("context-timeline-{}.json", self.run_id)))
                .map(|path| {
                    self.mux.info(
                        COMPONENT,
                        format!("context timeline saved to {}", path.display()),
                    );
                })
        };

        for result in [&skillbook, &checkpoint, &timeline] {
            if let Err(err) = result {
                self.mux
                    .error(COMPONENT, format!("shutdown persistence failed: {err:#}"));
            }
        }
        skillbook.and(checkpoint).and(timeline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::checkpoint::load_checkpoint;
    use crate::io::executor::ExecOutcome;
    use crate::io::iteration_log::load_iterations;
    use crate::io::prompt::StaticPrompt;
    use crate::test_support::{RecordingSink, ScriptedExecutor};
    use std::path::Path;

    fn mux(sink: &RecordingSink) -> Arc<ObservabilityMultiplexer> {
        Arc::new(
            ObservabilityMultiplexer::builder(std::env::temp_dir())
                .min_level(LogLevel::Debug)
                .console(false)
                .file(false)
                .sink(Box::new(sink.clone()))
                .build()
                .expect("mux"),
        )
    }

    fn scheduler(
        root: &Path,
        settings: SchedulerSettings,
        executor: &ScriptedExecutor,
        sink: &RecordingSink,
    ) -> IterationScheduler {
        let mux = mux(sink);
        IterationScheduler::new(
            settings,
            AgentPaths::new(root),
            Box::new(StaticPrompt("do the work".to_string())),
            Arc::new(executor.clone()),
            LearningAdapter::disabled(Arc::clone(&mux)),
            mux,
        )
        .with_run_id("run-test")
    }

    #[test]
    fn stops_when_completion_marker_appears() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            ExecOutcome::succeeded("working"),
            ExecOutcome::succeeded("all good LOOP_COMPLETE"),
        ]);
        let sink = RecordingSink::new();
        let outcome = scheduler(temp.path(), SchedulerSettings::default(), &executor, &sink)
            .run()
            .expect("run");

        assert_eq!(outcome.stop_reason, StopReason::Completed);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.successes, 2);
        assert_eq!(executor.calls(), 2);
    }

    #[test]
    fn stops_at_max_iterations() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome::succeeded("not yet")]);
        let sink = RecordingSink::new();
        let settings = SchedulerSettings {
            max_iterations: 3,
            ..SchedulerSettings::default()
        };
        let outcome = scheduler(temp.path(), settings, &executor, &sink)
            .run()
            .expect("run");

        assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
        assert_eq!(outcome.iterations, 3);
        assert_eq!(outcome.tool_summary.total_calls, 3);
    }

    #[test]
    fn reported_tokens_are_logged_with_the_iteration() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome {
            tokens_used: Some(77),
            ..ExecOutcome::succeeded("LOOP_COMPLETE")
        }]);
        let sink = RecordingSink::new();
        scheduler(temp.path(), SchedulerSettings::default(), &executor, &sink)
            .run()
            .expect("run");

        let finished = sink
            .entries()
            .into_iter()
            .find(|entry| entry.message == "iteration 1 finished: SUCCESS")
            .expect("finish entry");
        let metadata = finished.metadata.expect("metadata");
        assert_eq!(metadata["tokens_used"], 77);
    }

    #[test]
    fn unbounded_runtime_budget_has_no_deadline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome::succeeded("not yet")]);
        let sink = RecordingSink::new();
        let settings = SchedulerSettings {
            max_iterations: 1,
            max_runtime: Duration::from_secs(u64::MAX),
            ..SchedulerSettings::default()
        };
        let outcome = scheduler(temp.path(), settings.clone(), &executor, &sink)
            .run()
            .expect("run");

        assert_eq!(outcome.stop_reason, StopReason::MaxIterations);
        assert_eq!(outcome.iterations, 1);
        let requests = executor.requests();
        assert_eq!(requests[0].timeout, settings.iteration_timeout);
    }

    #[test]
    fn consecutive_failures_reset_on_success() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![
            ExecOutcome::failed("", "boom"),
            ExecOutcome::succeeded("ok"),
            ExecOutcome::failed("", "boom"),
            ExecOutcome::failed("", "boom"),
        ]);
        let sink = RecordingSink::new();
        let settings = SchedulerSettings {
            max_consecutive_failures: 2,
            ..SchedulerSettings::default()
        };
        let outcome = scheduler(temp.path(), settings, &executor, &sink)
            .run()
            .expect("run");

        assert_eq!(outcome.stop_reason, StopReason::FailureThreshold);
        assert_eq!(outcome.iterations, 4);
        assert_eq!(outcome.successes, 1);
        assert_eq!(outcome.failures, 3);
    }

    #[test]
    fn cancelled_before_start_runs_nothing_but_persists() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome::succeeded("ok")]);
        let sink = RecordingSink::new();
        let mut scheduler = scheduler(temp.path(), SchedulerSettings::default(), &executor, &sink);
        scheduler.cancel_token().cancel();

        let outcome = scheduler.run().expect("run");
        assert_eq!(outcome.stop_reason, StopReason::Cancelled);
        assert_eq!(executor.calls(), 0);
        let checkpoint = load_checkpoint(&temp.path().join(".agent/state/checkpoint.json"))
            .expect("load")
            .expect("checkpoint");
        assert_eq!(checkpoint.next_iteration, 1);
        assert_eq!(checkpoint.run_id.as_deref(), Some("run-test"));
    }

    #[test]
    fn state_transitions_are_logged_and_end_terminated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome::succeeded("LOOP_COMPLETE")]);
        let sink = RecordingSink::new();
        let settings = SchedulerSettings {
            checkpoint_interval: 1,
            ..SchedulerSettings::default()
        };
        let mut scheduler = scheduler(temp.path(), settings, &executor, &sink);
        scheduler.run().expect("run");
        assert_eq!(scheduler.state(), LoopState::Terminated);

        let transitions: Vec<String> = sink
            .messages()
            .into_iter()
            .filter(|msg| msg.starts_with("state "))
            .collect();
        assert_eq!(
            transitions,
            vec![
                "state idle -> preparing",
                "state preparing -> executing",
                "state executing -> reflecting",
                "state reflecting -> checkpointing",
                "state checkpointing -> idle",
                "state idle -> terminated",
            ]
        );
    }

    #[test]
    fn iteration_records_and_measurements_are_written() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(vec![ExecOutcome::failed("partial", "exit code 1")]);
        let sink = RecordingSink::new();
        let settings = SchedulerSettings {
            max_iterations: 2,
            ..SchedulerSettings::default()
        };
        let mut scheduler = scheduler(temp.path(), settings, &executor, &sink);
        scheduler.run().expect("run");

        let records =
            load_iterations(&temp.path().join(".agent/iterations"), "run-test").expect("load");
        assert_eq!(records.len(), 2);
        assert!(!records[0].success);
        assert_eq!(records[0].mode, ExecutionMode::Direct);
        assert_eq!(records[1].error.as_deref(), Some("exit code 1"));

        let points: Vec<MeasurePoint> = scheduler
            .context()
            .measurements()
            .iter()
            .filter(|m| m.iteration == 1)
            .map(|m| m.measure_point)
            .collect();
        assert_eq!(
            points,
            vec![
                MeasurePoint::IterationStart,
                MeasurePoint::AfterResponse,
                MeasurePoint::IterationEnd,
            ]
        );
        assert!(
            temp.path()
                .join(".agent/metrics/context-timeline-run-test.json")
                .is_file()
        );
    }

    #[test]
    fn executor_errors_are_fatal_after_persisting() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new(Vec::new());
        let sink = RecordingSink::new();
        let err = scheduler(temp.path(), SchedulerSettings::default(), &executor, &sink)
            .run()
            .unwrap_err();

        assert!(format!("{err:#}").contains("execute iteration 1"));
        assert!(temp.path().join(".agent/state/checkpoint.json").is_file());
        assert!(
            sink.messages()
                .iter()
                .any(|msg| msg.starts_with("run run-test aborted"))
        );
    }

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(new_run_id(), new_run_id());
    }
}
