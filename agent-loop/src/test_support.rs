//! Test doubles: scripted executors, runners and learning roles, plus
//! in-memory log sinks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};

use crate::core::skillbook::{Skill, SkillUpdate};
use crate::io::executor::{AgentExecutor, ExecContext, ExecOutcome, ExecRequest};
use crate::learning::roles::{LearningSample, Reflection, Reflector, SkillCurator};
use crate::observe::entry::LogEntry;
use crate::observe::sink::Sink;
use crate::orchestration::runner::{SubagentRun, SubagentRunner, SubagentTask};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pops scripted items in order and repeats the last one once the script
/// runs out.
struct Script<T: Clone> {
    items: VecDeque<T>,
    last: Option<T>,
}

impl<T: Clone> Script<T> {
    fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
            last: None,
        }
    }

    fn next(&mut self) -> Option<T> {
        if let Some(item) = self.items.pop_front() {
            self.last = Some(item.clone());
            return Some(item);
        }
        self.last.clone()
    }
}

/// Sink that keeps every entry in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct RecordingSink {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        lock(&self.entries).clone()
    }

    pub fn messages(&self) -> Vec<String> {
        lock(&self.entries)
            .iter()
            .map(|entry| entry.message.clone())
            .collect()
    }
}

impl Sink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    fn write(&mut self, entry: &LogEntry) -> bool {
        lock(&self.entries).push(entry.clone());
        true
    }
}

/// Sink that drops everything.
pub struct FailingSink;

impl Sink for FailingSink {
    fn name(&self) -> &str {
        "failing"
    }

    fn write(&mut self, _entry: &LogEntry) -> bool {
        false
    }
}

/// Executor returning scripted outcomes and recording the prompts it saw.
#[derive(Clone)]
pub struct ScriptedExecutor {
    script: Arc<Mutex<Script<ExecOutcome>>>,
    requests: Arc<Mutex<Vec<ExecRequest>>>,
}

impl ScriptedExecutor {
    pub fn new(outcomes: Vec<ExecOutcome>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::new(outcomes))),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<ExecRequest> {
        lock(&self.requests).clone()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.requests)
            .iter()
            .map(|request| request.prompt.clone())
            .collect()
    }

    pub fn calls(&self) -> usize {
        lock(&self.requests).len()
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    fn execute(&self, request: &ExecRequest, ctx: &ExecContext<'_>) -> Result<ExecOutcome> {
        lock(&self.requests).push(request.clone());
        let outcome = lock(&self.script)
            .next()
            .ok_or_else(|| anyhow!("scripted executor has no outcomes"))?;
        if let Some(tools) = ctx.tools {
            let handle = tools.start_call("scripted", serde_json::json!({}));
            tools.end_call(handle, None, outcome.success, outcome.error.as_deref());
        }
        Ok(outcome)
    }
}

/// Subagent runner with scripted runs. `Err(text)` simulates a subagent that
/// could not be started. An empty script yields successful empty runs.
#[derive(Clone)]
pub struct ScriptedSubagentRunner {
    script: Arc<Mutex<Script<Result<SubagentRun, String>>>>,
    tasks: Arc<Mutex<Vec<SubagentTask>>>,
}

impl ScriptedSubagentRunner {
    pub fn new(runs: Vec<Result<SubagentRun, String>>) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::new(runs))),
            tasks: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn tasks(&self) -> Vec<SubagentTask> {
        lock(&self.tasks).clone()
    }
}

impl SubagentRunner for ScriptedSubagentRunner {
    fn run(&self, task: &SubagentTask) -> Result<SubagentRun> {
        lock(&self.tasks).push(task.clone());
        match lock(&self.script).next() {
            Some(Ok(run)) => Ok(run),
            Some(Err(message)) => Err(anyhow!(message)),
            None => Ok(SubagentRun {
                exit_success: true,
                ..SubagentRun::default()
            }),
        }
    }
}

/// Reflector returning a fixed reflection, or a fixed error.
#[derive(Clone, Default)]
pub struct ScriptedReflector {
    reflection: Reflection,
    error: Option<String>,
    samples: Arc<Mutex<Vec<LearningSample>>>,
}

impl ScriptedReflector {
    pub fn new(reflection: Reflection) -> Self {
        Self {
            reflection,
            ..Self::default()
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// Every sample this reflector (or a clone of it) received.
    pub fn samples(&self) -> Arc<Mutex<Vec<LearningSample>>> {
        Arc::clone(&self.samples)
    }
}

impl Reflector for ScriptedReflector {
    fn reflect(&self, sample: &LearningSample, _skills: &[Skill]) -> Result<Reflection> {
        lock(&self.samples).push(sample.clone());
        match &self.error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(self.reflection.clone()),
        }
    }
}

/// Curator returning scripted updates in order, then empty updates.
#[derive(Clone)]
pub struct ScriptedCurator {
    updates: Arc<Mutex<VecDeque<SkillUpdate>>>,
}

impl ScriptedCurator {
    pub fn new(updates: Vec<SkillUpdate>) -> Self {
        Self {
            updates: Arc::new(Mutex::new(updates.into())),
        }
    }
}

impl SkillCurator for ScriptedCurator {
    fn curate(
        &self,
        _sample: &LearningSample,
        _reflection: &Reflection,
        _skills: &[Skill],
        _max_skills: usize,
    ) -> Result<SkillUpdate> {
        Ok(lock(&self.updates).pop_front().unwrap_or_default())
    }
}
