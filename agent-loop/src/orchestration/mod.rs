//! Delegation of iterations to specialized subagents.
//!
//! The orchestrator classifies a prompt, checks that the chosen subagent's
//! capabilities are available, runs it, records its result write-once in the
//! coordination store and aggregates all recorded results into one verdict.

pub mod coordination;
pub mod profiles;
pub mod runner;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::instrument;
use uuid::Uuid;

use crate::core::classifier::classify_prompt;
use crate::core::text::last_json_object;
use crate::core::types::{LogLevel, SubagentType, Verdict};
use crate::error::OrchestrationError;
use crate::io::capabilities::CapabilityRegistry;
use crate::io::prompt::{PromptEngine, SubagentInputs};
use crate::observe::entry::LogEntry;
use crate::observe::multiplexer::ObservabilityMultiplexer;
use crate::observe::tool_calls::ToolCallTracker;
use crate::orchestration::coordination::{AttemptInfo, CoordinationStore, SubagentResult};
use crate::orchestration::profiles::profile_for;
use crate::orchestration::runner::{SubagentRunner, SubagentTask};

const COMPONENT: &str = "Orchestrator";

/// Overall outcome of the recorded subagent results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregatedResult {
    pub verdict: Verdict,
    pub summary: String,
    pub failing_subagents: Vec<String>,
    pub results: Vec<SubagentResult>,
}

impl AggregatedResult {
    /// Verdict over `results`: PASS only if every one succeeded.
    pub fn from_results(results: Vec<SubagentResult>) -> Self {
        if results.is_empty() {
            return Self {
                verdict: Verdict::NoResults,
                summary: "No subagent results found.".to_string(),
                failing_subagents: Vec::new(),
                results,
            };
        }
        let failing_subagents: Vec<String> = results
            .iter()
            .filter(|result| !result.success)
            .map(|result| format!("{}-{}", result.subagent_type, result.subagent_id))
            .collect();
        let fail = failing_subagents.len();
        let pass = results.len() - fail;
        Self {
            verdict: if fail == 0 { Verdict::Pass } else { Verdict::Fail },
            summary: format!(
                "{pass} passed, {fail} failed out of {} subagent(s)",
                results.len()
            ),
            failing_subagents,
            results,
        }
    }
}

pub struct SubagentOrchestrator {
    registry: CapabilityRegistry,
    store: CoordinationStore,
    runner: Box<dyn SubagentRunner>,
    engine: PromptEngine,
    workdir: PathBuf,
    mux: Arc<ObservabilityMultiplexer>,
}

impl SubagentOrchestrator {
    pub fn new(
        registry: CapabilityRegistry,
        store: CoordinationStore,
        runner: Box<dyn SubagentRunner>,
        workdir: impl Into<PathBuf>,
        mux: Arc<ObservabilityMultiplexer>,
    ) -> Self {
        Self {
            registry,
            store,
            runner,
            engine: PromptEngine::new(),
            workdir: workdir.into(),
            mux,
        }
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CoordinationStore {
        &self.store
    }

    pub fn classify(&self, prompt: &str) -> SubagentType {
        let kind = classify_prompt(prompt);
        self.mux
            .debug(COMPONENT, format!("prompt classified as {kind}"));
        kind
    }

    /// Subagent type by name, as written in configs and prompts.
    pub fn parse_type(name: &str) -> Result<SubagentType, OrchestrationError> {
        name.parse()
            .map_err(|_| OrchestrationError::UnknownSubagentType(name.trim().to_string()))
    }

    /// Fail unless every required capability of `kind` is configured and
    /// enabled.
    pub fn verify_required_mcps(&self, kind: SubagentType) -> Result<(), OrchestrationError> {
        let profile = profile_for(kind);
        let gap = self.registry.gap(profile.required_capabilities);
        if gap.is_empty() {
            return Ok(());
        }
        let err = OrchestrationError::MissingCapabilities {
            subagent: kind,
            missing: gap.missing,
            disabled: gap.disabled,
            registry: self.registry.source().to_path_buf(),
        };
        self.mux.error(COMPONENT, err.to_string());
        Err(err)
    }

    /// Capability listing with the status of each server.
    pub fn mcp_list(&self, kind: SubagentType) -> String {
        let profile = profile_for(kind);
        let mut buf = String::from("**Required MCP Servers:**\n");
        if profile.required_capabilities.is_empty() {
            buf.push_str("- none\n");
        }
        for name in profile.required_capabilities {
            buf.push_str(&format!(
                "- `{name}` ({})\n",
                self.registry.status(name).label()
            ));
        }
        if !profile.optional_capabilities.is_empty() {
            buf.push_str("\n**Optional MCP Servers (if available):**\n");
            for name in profile.optional_capabilities {
                buf.push_str(&format!(
                    "- `{name}` ({})\n",
                    self.registry.status(name).label()
                ));
            }
        }
        buf
    }

    /// Full subagent prompt for `kind` working on `criteria`.
    pub fn generate_subagent_prompt(
        &self,
        kind: SubagentType,
        phase: &str,
        criteria: &[String],
    ) -> Result<String> {
        let profile = profile_for(kind);
        let skills = if profile.required_skills.is_empty() {
            "No specific skills required.".to_string()
        } else {
            let mut buf = String::from("**Required Skills (MUST load):**\n");
            for skill in profile.required_skills {
                buf.push_str(&format!("- {skill}\n"));
            }
            buf
        };

        let mut task = format!("**Phase:** {phase}\n\n**Acceptance Criteria:**\n");
        for (idx, criterion) in criteria.iter().enumerate() {
            task.push_str(&format!("{}. {criterion}\n", idx + 1));
        }
        task.push_str("\nValidate each criterion through REAL execution and collect evidence.");

        self.engine.render_subagent(&SubagentInputs {
            kind: kind.as_str(),
            role: profile.role,
            skill_instructions: &skills,
            mcp_list: &self.mcp_list(kind),
            task_description: &task,
            attempt_path: &self.store.attempt_path(),
            shared_context_path: &self.store.shared_context_path(),
            journal_path: &self.store.journal_path(),
        })
    }

    pub fn begin_attempt(
        &self,
        attempt_number: u32,
        phase: &str,
        criteria: &[String],
    ) -> Result<AttemptInfo> {
        self.store.begin_attempt(attempt_number, phase, criteria)
    }

    pub fn write_shared_context(&self, sections: &[(&str, &str)]) -> Result<PathBuf> {
        self.store.write_shared_context(sections)
    }

    pub fn append_to_journal(&self, attempt_number: u32, entry: &str) -> Result<PathBuf> {
        self.store.append_to_journal(attempt_number, entry)
    }

    /// Run one subagent and record its result.
    ///
    /// Capability gaps are returned as [`OrchestrationError`] before anything
    /// is spawned. A subagent that cannot be started is recorded as a failed
    /// result.
    #[instrument(skip_all, fields(kind = %kind, timeout_secs = timeout.as_secs()))]
    pub fn spawn_subagent(
        &self,
        kind: SubagentType,
        prompt: &str,
        timeout: Duration,
        tools: Option<&ToolCallTracker>,
    ) -> Result<SubagentResult> {
        self.verify_required_mcps(kind)?;
        let profile = profile_for(kind);
        let task = SubagentTask {
            kind,
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            prompt: prompt.to_string(),
            required_capabilities: profile
                .required_capabilities
                .iter()
                .map(|name| (*name).to_string())
                .collect(),
            timeout,
            workdir: self.workdir.clone(),
        };
        self.mux.emit(
            LogEntry::new(
                LogLevel::Info,
                COMPONENT,
                format!("spawning {kind} subagent {}", task.id),
            )
            .with_meta("subagent_id", task.id.as_str())
            .with_meta("timeout_secs", timeout.as_secs()),
        );

        let handle = tools.map(|tools| {
            tools.start_call(
                &format!("subagent:{kind}"),
                json!({ "subagent_id": task.id, "timeout_secs": timeout.as_secs() }),
            )
        });
        let started = Instant::now();
        let result = match self.runner.run(&task) {
            Ok(run) => {
                let parsed_json = last_json_object(&run.stdout);
                let verdict = parsed_json
                    .as_ref()
                    .and_then(payload_verdict)
                    .unwrap_or(if run.exit_success {
                        Verdict::Pass
                    } else {
                        Verdict::Fail
                    });
                let success = verdict == Verdict::Pass && !run.timed_out;
                SubagentResult {
                    subagent_type: kind,
                    subagent_id: task.id.clone(),
                    success,
                    verdict: if success { Verdict::Pass } else { Verdict::Fail },
                    stdout: run.stdout,
                    stderr: run.stderr,
                    parsed_json,
                    error: run.error,
                    timed_out: run.timed_out,
                    duration_ms: started.elapsed().as_millis() as u64,
                }
            }
            Err(err) => SubagentResult {
                subagent_type: kind,
                subagent_id: task.id.clone(),
                success: false,
                verdict: Verdict::Fail,
                stdout: String::new(),
                stderr: String::new(),
                parsed_json: None,
                error: Some(format!("{err:#}")),
                timed_out: false,
                duration_ms: started.elapsed().as_millis() as u64,
            },
        };

        if let (Some(tools), Some(handle)) = (tools, handle) {
            tools.end_call(
                handle,
                Some(result.verdict.as_str()),
                result.success,
                result.error.as_deref(),
            );
        }
        let path = self.store.write_result(&result)?;
        let level = if result.success {
            LogLevel::Info
        } else {
            LogLevel::Warn
        };
        self.mux.emit(
            LogEntry::new(
                level,
                COMPONENT,
                format!("{kind} subagent {} finished: {}", result.subagent_id, result.verdict),
            )
            .with_meta("result_path", path.display().to_string())
            .with_meta("duration_ms", result.duration_ms)
            .with_meta("timed_out", result.timed_out),
        );
        Ok(result)
    }

    /// Aggregate every result recorded for the current attempt.
    pub fn aggregate_results(&self) -> Result<AggregatedResult> {
        let aggregated = AggregatedResult::from_results(self.store.collect_results()?);
        let mut metadata = Map::new();
        metadata.insert("verdict".to_string(), Value::from(aggregated.verdict.as_str()));
        metadata.insert(
            "failing_subagents".to_string(),
            Value::from(aggregated.failing_subagents.clone()),
        );
        self.mux.log(
            LogLevel::Info,
            COMPONENT,
            format!("aggregated: {}", aggregated.summary),
            Some(metadata),
        );
        Ok(aggregated)
    }
}

/// `verdict` field of a subagent payload, if it names one.
fn payload_verdict(payload: &Map<String, Value>) -> Option<Verdict> {
    let verdict = payload.get("verdict")?.as_str()?;
    if verdict.eq_ignore_ascii_case("pass") {
        Some(Verdict::Pass)
    } else if verdict.eq_ignore_ascii_case("fail") {
        Some(Verdict::Fail)
    } else {
        None
    }
}
