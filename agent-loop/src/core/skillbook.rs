//! Skillbook data model: learned strategies, update deltas, and pruning.
//!
//! The skillbook is an ordered list; insertion order is the rendering order
//! and the tie-break when pruning equally scored skills.

use serde::{Deserialize, Serialize};

/// A single learned strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub content: String,
    #[serde(default)]
    pub helpful: u32,
    #[serde(default)]
    pub harmful: u32,
    pub created_at: String,
    #[serde(default)]
    pub updated_at: Option<String>,
}

impl Skill {
    /// Net usefulness, `helpful - harmful`.
    pub fn score(&self) -> i64 {
        i64::from(self.helpful) - i64::from(self.harmful)
    }
}

/// One operation of a skill-update delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkillOperation {
    /// Append a new strategy.
    Add { content: String },
    /// Replace the content of an existing strategy.
    Update { id: String, content: String },
    /// Adjust usefulness counters.
    Tag {
        id: String,
        #[serde(default)]
        helpful: u32,
        #[serde(default)]
        harmful: u32,
    },
    /// Drop a strategy.
    Remove { id: String },
}

/// Delta produced by the skill-update step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillUpdate {
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub operations: Vec<SkillOperation>,
}

/// Counts of what an applied update changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub added: Vec<String>,
    pub updated: Vec<String>,
    pub tagged: Vec<String>,
    pub removed: Vec<String>,
    /// Operations referencing ids that no longer exist (or blank content).
    pub skipped: usize,
}

impl UpdateReport {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.updated.is_empty()
            && self.tagged.is_empty()
            && self.removed.is_empty()
    }
}

/// Ordered collection of skills, as persisted to `skillbook.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skillbook {
    #[serde(default)]
    pub skills: Vec<Skill>,
}

impl Skillbook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.skills.len()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Skill> {
        self.skills.iter().find(|skill| skill.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut Skill> {
        self.skills.iter_mut().find(|skill| skill.id == id)
    }

    /// Next free id in the `skill-00001` sequence.
    fn next_id(&self) -> String {
        let max = self
            .skills
            .iter()
            .filter_map(|skill| skill.id.strip_prefix("skill-"))
            .filter_map(|suffix| suffix.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("skill-{:05}", max + 1)
    }

    /// Append a strategy and return its id.
    pub fn add(&mut self, content: &str, now: &str) -> String {
        let id = self.next_id();
        self.skills.push(Skill {
            id: id.clone(),
            content: content.trim().to_string(),
            helpful: 0,
            harmful: 0,
            created_at: now.to_string(),
            updated_at: None,
        });
        id
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.skills.len();
        self.skills.retain(|skill| skill.id != id);
        self.skills.len() != before
    }

    /// Apply an update delta in order. Operations against unknown ids are
    /// skipped rather than failing the whole delta.
    pub fn apply_update(&mut self, update: &SkillUpdate, now: &str) -> UpdateReport {
        let mut report = UpdateReport::default();
        for op in &update.operations {
            match op {
                SkillOperation::Add { content } => {
                    if content.trim().is_empty() {
                        report.skipped += 1;
                        continue;
                    }
                    report.added.push(self.add(content, now));
                }
                SkillOperation::Update { id, content } => match self.get_mut(id) {
                    Some(skill) if !content.trim().is_empty() => {
                        skill.content = content.trim().to_string();
                        skill.updated_at = Some(now.to_string());
                        report.updated.push(id.clone());
                    }
                    _ => report.skipped += 1,
                },
                SkillOperation::Tag {
                    id,
                    helpful,
                    harmful,
                } => match self.get_mut(id) {
                    Some(skill) => {
                        skill.helpful = skill.helpful.saturating_add(*helpful);
                        skill.harmful = skill.harmful.saturating_add(*harmful);
                        skill.updated_at = Some(now.to_string());
                        report.tagged.push(id.clone());
                    }
                    None => report.skipped += 1,
                },
                SkillOperation::Remove { id } => {
                    if self.remove(id) {
                        report.removed.push(id.clone());
                    } else {
                        report.skipped += 1;
                    }
                }
            }
        }
        report
    }

    /// Remove the lowest-scoring skills until at most `max_skills` remain.
    ///
    /// Ties are broken by insertion order: older skills go first. Returns the
    /// removed ids.
    pub fn prune(&mut self, max_skills: usize) -> Vec<String> {
        if self.skills.len() <= max_skills {
            return Vec::new();
        }
        let excess = self.skills.len() - max_skills;
        let mut ranked: Vec<(usize, i64)> = self
            .skills
            .iter()
            .enumerate()
            .map(|(idx, skill)| (idx, skill.score()))
            .collect();
        // Stable sort keeps insertion order among equal scores.
        ranked.sort_by_key(|(_, score)| *score);

        let mut doomed: Vec<usize> = ranked.iter().take(excess).map(|(idx, _)| *idx).collect();
        doomed.sort_unstable();

        let removed = doomed
            .iter()
            .map(|idx| self.skills[*idx].id.clone())
            .collect();
        let mut idx = 0usize;
        self.skills.retain(|_| {
            let keep = doomed.binary_search(&idx).is_err();
            idx += 1;
            keep
        });
        removed
    }

    /// Highest-scoring skills first (stable for equal scores).
    pub fn top_skills(&self, limit: usize) -> Vec<&Skill> {
        let mut sorted: Vec<&Skill> = self.skills.iter().collect();
        sorted.sort_by_key(|skill| std::cmp::Reverse(skill.score()));
        sorted.truncate(limit);
        sorted
    }

    /// Deterministic prompt block listing every skill in skillbook order.
    pub fn render_context(&self) -> String {
        let mut buf = String::from("## Learned Strategies\n\n");
        buf.push_str(
            "Strategies learned from previous iterations. Apply the ones relevant to this task \
             and ignore the rest.\n\n",
        );
        for skill in &self.skills {
            buf.push_str(&format!(
                "- [{}] {} (helpful={}, harmful={})\n",
                skill.id, skill.content, skill.helpful, skill.harmful
            ));
        }
        buf
    }
}
