//! Reflection and curation roles.
//!
//! A [`Reflector`] explains why an iteration went the way it did; a
//! [`SkillCurator`] turns that explanation into a [`SkillUpdate`]. The shipped
//! implementations prompt an [`AgentExecutor`] and parse the JSON object at
//! the end of its output.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::core::skillbook::{Skill, SkillOperation, SkillUpdate};
use crate::core::text::last_json_object;
use crate::io::executor::{AgentExecutor, ExecContext, ExecRequest};
use crate::io::prompt::{CurateInputs, PromptEngine, ReflectInputs};

const SKILL_UPDATE_SCHEMA: &str = include_str!("../../schemas/skill_update.schema.json");

/// One finished iteration, truncated for the learning prompts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningSample {
    /// The task, as asked.
    pub question: String,
    /// Shorter task excerpt handed to the curator.
    pub context: String,
    pub output: String,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillTagKind {
    Helpful,
    Harmful,
    Neutral,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillTag {
    pub id: String,
    pub tag: SkillTagKind,
}

/// Analysis of one iteration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reflection {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub key_insight: String,
    #[serde(default)]
    pub skill_tags: Vec<SkillTag>,
}

impl Reflection {
    /// Counter adjustments implied by the reflection's tags.
    pub fn tag_operations(&self) -> Vec<SkillOperation> {
        self.skill_tags
            .iter()
            .filter_map(|tag| {
                let (helpful, harmful) = match tag.tag {
                    SkillTagKind::Helpful => (1, 0),
                    SkillTagKind::Harmful => (0, 1),
                    SkillTagKind::Neutral => return None,
                };
                Some(SkillOperation::Tag {
                    id: tag.id.clone(),
                    helpful,
                    harmful,
                })
            })
            .collect()
    }
}

pub trait Reflector: Send + Sync {
    fn reflect(&self, sample: &LearningSample, skills: &[Skill]) -> Result<Reflection>;
}

pub trait SkillCurator: Send + Sync {
    fn curate(
        &self,
        sample: &LearningSample,
        reflection: &Reflection,
        skills: &[Skill],
        max_skills: usize,
    ) -> Result<SkillUpdate>;
}

/// Runs learning prompts through an executor.
#[derive(Clone)]
struct PromptRunner {
    executor: Arc<dyn AgentExecutor>,
    workdir: PathBuf,
    timeout: Duration,
}

impl PromptRunner {
    fn run(&self, role: &str, prompt: String) -> Result<Value> {
        let request = ExecRequest {
            workdir: self.workdir.clone(),
            prompt,
            iteration: 0,
            timeout: self.timeout,
        };
        let outcome = self
            .executor
            .execute(&request, &ExecContext::default())
            .with_context(|| format!("run {role} prompt"))?;
        if !outcome.success {
            return Err(anyhow!(
                "{role} prompt failed: {}",
                outcome.error.as_deref().unwrap_or("no error reported")
            ));
        }
        let object = last_json_object(&outcome.output)
            .ok_or_else(|| anyhow!("{role} output has no JSON object"))?;
        debug!(role, keys = object.len(), "learning response parsed");
        Ok(Value::Object(object))
    }
}

/// Reflector backed by an [`AgentExecutor`].
pub struct ExecutorReflector {
    runner: PromptRunner,
    engine: PromptEngine,
}

impl ExecutorReflector {
    pub fn new(executor: Arc<dyn AgentExecutor>, workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: PromptRunner {
                executor,
                workdir,
                timeout,
            },
            engine: PromptEngine::new(),
        }
    }
}

impl Reflector for ExecutorReflector {
    #[instrument(skip_all, fields(success = sample.success, skills = skills.len()))]
    fn reflect(&self, sample: &LearningSample, skills: &[Skill]) -> Result<Reflection> {
        let prompt = self.engine.render_reflect(&ReflectInputs {
            question: &sample.question,
            output: &sample.output,
            success: sample.success,
            error: sample.error.as_deref(),
            skills,
        })?;
        let value = self.runner.run("reflection", prompt)?;
        serde_json::from_value(value).context("parse reflection")
    }
}

/// Curator backed by an [`AgentExecutor`]; its output is schema-checked
/// before it reaches the skillbook.
pub struct ExecutorCurator {
    runner: PromptRunner,
    engine: PromptEngine,
}

impl ExecutorCurator {
    pub fn new(executor: Arc<dyn AgentExecutor>, workdir: PathBuf, timeout: Duration) -> Self {
        Self {
            runner: PromptRunner {
                executor,
                workdir,
                timeout,
            },
            engine: PromptEngine::new(),
        }
    }
}

impl SkillCurator for ExecutorCurator {
    #[instrument(skip_all, fields(skills = skills.len(), max_skills = max_skills))]
    fn curate(
        &self,
        sample: &LearningSample,
        reflection: &Reflection,
        skills: &[Skill],
        max_skills: usize,
    ) -> Result<SkillUpdate> {
        let reflection_json =
            serde_json::to_string_pretty(reflection).context("serialize reflection")?;
        let prompt = self.engine.render_curate(&CurateInputs {
            context: &sample.context,
            reflection: &reflection_json,
            skills,
            max_skills,
        })?;
        let value = self.runner.run("curation", prompt)?;
        parse_skill_update(value)
    }
}

/// Validate a raw update against the embedded schema and deserialize it.
pub fn parse_skill_update(value: Value) -> Result<SkillUpdate> {
    let schema: Value =
        serde_json::from_str(SKILL_UPDATE_SCHEMA).context("parse skill update schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    if !compiled.is_valid(&value) {
        let messages = compiled
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "skill update schema validation failed: {}",
            messages.join("; ")
        ));
    }
    serde_json::from_value(value).context("deserialize skill update")
}
