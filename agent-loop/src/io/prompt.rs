//! Prompt sources for the loop and templates for learning and subagent prompts.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use serde::Serialize;
use tracing::debug;

use crate::core::skillbook::Skill;

const REFLECT_TEMPLATE: &str = include_str!("prompts/reflect.md");
const CURATE_TEMPLATE: &str = include_str!("prompts/curate.md");
const SUBAGENT_TEMPLATE: &str = include_str!("prompts/subagent.md");

/// Where the loop gets the task prompt for each iteration.
pub trait PromptSource: Send {
    fn load(&self, iteration: u32) -> Result<String>;
}

/// Prompt read from a file at the start of every iteration, so edits made
/// while the loop runs take effect on the next iteration.
#[derive(Debug, Clone)]
pub struct FilePrompt {
    path: PathBuf,
}

impl FilePrompt {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PromptSource for FilePrompt {
    fn load(&self, iteration: u32) -> Result<String> {
        let prompt = fs::read_to_string(&self.path)
            .with_context(|| format!("read prompt {}", self.path.display()))?;
        if prompt.trim().is_empty() {
            return Err(anyhow!("prompt file {} is empty", self.path.display()));
        }
        debug!(path = %self.path.display(), iteration, chars = prompt.len(), "prompt loaded");
        Ok(prompt)
    }
}

/// Fixed prompt text.
#[derive(Debug, Clone)]
pub struct StaticPrompt(pub String);

impl PromptSource for StaticPrompt {
    fn load(&self, _iteration: u32) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Skill as shown to the reflection and curation prompts.
#[derive(Debug, Clone, Serialize)]
struct SkillView {
    id: String,
    content: String,
    helpful: u32,
    harmful: u32,
}

impl From<&Skill> for SkillView {
    fn from(skill: &Skill) -> Self {
        Self {
            id: skill.id.clone(),
            content: skill.content.clone(),
            helpful: skill.helpful,
            harmful: skill.harmful,
        }
    }
}

/// Inputs for the reflection prompt.
#[derive(Debug, Clone, Copy)]
pub struct ReflectInputs<'a> {
    pub question: &'a str,
    pub output: &'a str,
    pub success: bool,
    pub error: Option<&'a str>,
    pub skills: &'a [Skill],
}

/// Inputs for the curation prompt.
#[derive(Debug, Clone, Copy)]
pub struct CurateInputs<'a> {
    pub context: &'a str,
    pub reflection: &'a str,
    pub skills: &'a [Skill],
    pub max_skills: usize,
}

/// Inputs for a subagent prompt. All text fields are pre-rendered.
#[derive(Debug, Clone, Copy)]
pub struct SubagentInputs<'a> {
    pub kind: &'a str,
    pub role: &'a str,
    pub skill_instructions: &'a str,
    pub mcp_list: &'a str,
    pub task_description: &'a str,
    pub attempt_path: &'a Path,
    pub shared_context_path: &'a Path,
    pub journal_path: &'a Path,
}

/// Template engine wrapper around minijinja.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("reflect", REFLECT_TEMPLATE)
            .expect("reflect template should be valid");
        env.add_template("curate", CURATE_TEMPLATE)
            .expect("curate template should be valid");
        env.add_template("subagent", SUBAGENT_TEMPLATE)
            .expect("subagent template should be valid");
        Self { env }
    }

    pub fn render_reflect(&self, input: &ReflectInputs<'_>) -> Result<String> {
        let skills: Vec<SkillView> = input.skills.iter().map(SkillView::from).collect();
        let template = self.env.get_template("reflect")?;
        let rendered = template.render(context! {
            question => input.question.trim(),
            output => input.output.trim(),
            success => input.success,
            error => input.error.map(str::trim).filter(|s| !s.is_empty()),
            skills => skills,
        })?;
        Ok(rendered)
    }

    pub fn render_curate(&self, input: &CurateInputs<'_>) -> Result<String> {
        let skills: Vec<SkillView> = input.skills.iter().map(SkillView::from).collect();
        let template = self.env.get_template("curate")?;
        let rendered = template.render(context! {
            context => input.context.trim(),
            reflection => input.reflection.trim(),
            skills => skills,
            max_skills => input.max_skills,
        })?;
        Ok(rendered)
    }

    pub fn render_subagent(&self, input: &SubagentInputs<'_>) -> Result<String> {
        let template = self.env.get_template("subagent")?;
        let rendered = template.render(context! {
            kind_upper => input.kind.to_uppercase(),
            role => input.role.trim(),
            skill_instructions => input.skill_instructions.trim(),
            mcp_list => input.mcp_list.trim(),
            task_description => input.task_description.trim(),
            attempt_path => input.attempt_path.display().to_string(),
            shared_context_path => input.shared_context_path.display().to_string(),
            journal_path => input.journal_path.display().to_string(),
        })?;
        Ok(rendered)
    }
}

impl Default for PromptEngine {
    fn default() -> Self {
        Self::new()
    }
}
