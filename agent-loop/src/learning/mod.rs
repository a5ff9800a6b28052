//! Skillbook-driven learning: prompt injection and the reflect/curate cycle.
//!
//! The skillbook lives behind one [`SkillbookHandle`]; every read and
//! mutation goes through its mutex. Reflection and curation run on a
//! snapshot, outside the lock, and only the resulting delta is applied under
//! it.

pub mod lane;
pub mod roles;

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde_json::{Value, json};
use tracing::{debug, instrument};

use crate::core::skillbook::{Skill, SkillUpdate, Skillbook, UpdateReport};
use crate::core::text::truncate_chars;
use crate::core::types::LogLevel;
use crate::io::config::LearningConfig;
use crate::io::skillbook_store::{ensure_writable_dir, load_skillbook, save_skillbook};
use crate::learning::lane::LearningLane;
use crate::learning::roles::{LearningSample, Reflector, SkillCurator};
use crate::observe::entry::LogEntry;
use crate::observe::multiplexer::ObservabilityMultiplexer;

/// Shared, lock-guarded skillbook.
pub type SkillbookHandle = Arc<Mutex<Skillbook>>;

const COMPONENT: &str = "Learning";

const QUESTION_CHARS: usize = 1000;
const CONTEXT_CHARS: usize = 500;
const OUTPUT_CHARS: usize = 2000;
const ERROR_CHARS: usize = 500;
const STATS_TOP_SKILLS: usize = 5;
const STATS_CONTENT_CHARS: usize = 100;

/// Resolved learning settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LearningSettings {
    pub enabled: bool,
    pub model: String,
    pub skillbook_path: PathBuf,
    pub async_learning: bool,
    pub max_skills: usize,
    pub queue_capacity: usize,
}

impl LearningSettings {
    /// Settings from config, with the skillbook path already resolved.
    pub fn from_config(cfg: &LearningConfig, skillbook_path: PathBuf) -> Self {
        Self {
            enabled: cfg.enabled,
            model: cfg.model.clone(),
            skillbook_path,
            async_learning: cfg.async_learning,
            max_skills: cfg.max_skills,
            queue_capacity: cfg.queue_capacity,
        }
    }
}

fn lock_book(handle: &SkillbookHandle) -> MutexGuard<'_, Skillbook> {
    handle.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The reflect, curate, apply pipeline. Shared with the background lane.
struct Learner {
    reflector: Box<dyn Reflector>,
    curator: Box<dyn SkillCurator>,
    skillbook: SkillbookHandle,
    max_skills: usize,
    mux: Arc<ObservabilityMultiplexer>,
}

impl Learner {
    /// Never fails; problems are reported as warnings. A panicking role is
    /// caught here so inline learning cannot take the loop down.
    fn learn(&self, sample: &LearningSample) {
        let Ok(result) = panic::catch_unwind(AssertUnwindSafe(|| self.try_learn(sample))) else {
            self.mux.warn(COMPONENT, "learning panicked; iteration kept");
            return;
        };
        match result {
            Ok(report) => {
                self.mux.emit(
                    LogEntry::new(
                        LogLevel::Info,
                        COMPONENT,
                        format!(
                            "skillbook updated: {} added, {} updated, {} tagged, {} removed",
                            report.added.len(),
                            report.updated.len(),
                            report.tagged.len(),
                            report.removed.len()
                        ),
                    )
                    .with_meta("skipped", report.skipped),
                );
            }
            Err(err) => self
                .mux
                .warn(COMPONENT, format!("learning failed: {err:#}")),
        }
    }

    #[instrument(skip_all, fields(success = sample.success))]
    fn try_learn(&self, sample: &LearningSample) -> Result<UpdateReport> {
        let snapshot: Vec<Skill> = lock_book(&self.skillbook).skills.clone();
        let reflection = self
            .reflector
            .reflect(sample, &snapshot)
            .context("reflect on iteration")?;
        let update = self
            .curator
            .curate(sample, &reflection, &snapshot, self.max_skills)
            .context("curate skill update")?;

        let mut operations = reflection.tag_operations();
        operations.extend(update.operations);
        let combined = SkillUpdate {
            reasoning: update.reasoning,
            operations,
        };

        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut book = lock_book(&self.skillbook);
        let mut report = book.apply_update(&combined, &now);
        let pruned = book.prune(self.max_skills);
        if !pruned.is_empty() {
            debug!(pruned = pruned.len(), "skillbook pruned");
        }
        report.removed.extend(pruned);
        Ok(report)
    }
}

/// Owns the skillbook and runs learning after each iteration.
pub struct LearningAdapter {
    settings: LearningSettings,
    skillbook: SkillbookHandle,
    learner: Option<Arc<Learner>>,
    lane: Option<LearningLane<LearningSample>>,
    mux: Arc<ObservabilityMultiplexer>,
}

impl LearningAdapter {
    /// Adapter that never injects or learns.
    pub fn disabled(mux: Arc<ObservabilityMultiplexer>) -> Self {
        Self {
            settings: LearningSettings {
                enabled: false,
                model: String::new(),
                skillbook_path: PathBuf::new(),
                async_learning: false,
                max_skills: 0,
                queue_capacity: 1,
            },
            skillbook: Arc::new(Mutex::new(Skillbook::new())),
            learner: None,
            lane: None,
            mux,
        }
    }

    /// Load the skillbook and start the learning lane.
    ///
    /// The skillbook directory must be writable; that failure is a
    /// [`StartupError`](crate::error::StartupError). A corrupted skillbook
    /// file is moved aside and learning starts from an empty one.
    pub fn new(
        settings: LearningSettings,
        reflector: Box<dyn Reflector>,
        curator: Box<dyn SkillCurator>,
        mux: Arc<ObservabilityMultiplexer>,
    ) -> Result<Self> {
        if !settings.enabled {
            return Ok(Self::disabled(mux));
        }
        ensure_writable_dir(&settings.skillbook_path)?;
        let loaded = load_skillbook(&settings.skillbook_path)?;
        if let Some(backup) = &loaded.recovered_backup {
            mux.warn(
                COMPONENT,
                format!(
                    "skillbook {} was unreadable; moved to {} and starting empty",
                    settings.skillbook_path.display(),
                    backup.display()
                ),
            );
        }
        let mut book = loaded.skillbook;
        let pruned = book.prune(settings.max_skills);
        if !pruned.is_empty() {
            mux.warn(
                COMPONENT,
                format!(
                    "skillbook held more than {} skills; pruned {}",
                    settings.max_skills,
                    pruned.join(", ")
                ),
            );
        }
        mux.info(
            COMPONENT,
            format!(
                "learning enabled: {} skills loaded from {}",
                book.len(),
                settings.skillbook_path.display()
            ),
        );

        let skillbook = Arc::new(Mutex::new(book));
        let learner = Arc::new(Learner {
            reflector,
            curator,
            skillbook: Arc::clone(&skillbook),
            max_skills: settings.max_skills,
            mux: Arc::clone(&mux),
        });
        let lane = if settings.async_learning {
            let worker = Arc::clone(&learner);
            Some(LearningLane::spawn(
                settings.queue_capacity,
                move |sample: LearningSample| worker.learn(&sample),
            )?)
        } else {
            None
        };

        Ok(Self {
            settings,
            skillbook,
            learner: Some(learner),
            lane,
            mux,
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.settings.enabled
    }

    pub fn settings(&self) -> &LearningSettings {
        &self.settings
    }

    pub fn skillbook(&self) -> SkillbookHandle {
        Arc::clone(&self.skillbook)
    }

    pub fn skill_count(&self) -> usize {
        lock_book(&self.skillbook).len()
    }

    /// Append the learned strategies to `prompt`.
    ///
    /// Returns the prompt unchanged when learning is disabled or the
    /// skillbook is empty.
    pub fn inject_context(&self, prompt: &str) -> String {
        if !self.is_enabled() {
            return prompt.to_string();
        }
        let book = lock_book(&self.skillbook);
        if book.is_empty() {
            return prompt.to_string();
        }
        format!("{}\n\n{}", prompt.trim_end(), book.render_context())
    }

    /// Learn from one finished iteration.
    ///
    /// Inline, or queued on the lane with `async_learning`. Failures are
    /// logged and never reach the caller.
    pub fn learn_from_execution(
        &self,
        task: &str,
        output: &str,
        success: bool,
        error: Option<&str>,
    ) {
        let Some(learner) = &self.learner else {
            return;
        };
        let sample = LearningSample {
            question: truncate_chars(task, QUESTION_CHARS).to_string(),
            context: truncate_chars(task, CONTEXT_CHARS).to_string(),
            output: truncate_chars(output, OUTPUT_CHARS).to_string(),
            success,
            error: error.map(|err| truncate_chars(err, ERROR_CHARS).to_string()),
        };
        match &self.lane {
            Some(lane) => {
                if let Err(err) = lane.submit(sample) {
                    self.mux
                        .warn(COMPONENT, format!("could not queue learning: {err:#}"));
                }
            }
            None => learner.learn(&sample),
        }
    }

    /// Wait for queued learning jobs.
    pub fn flush(&self) {
        if let Some(lane) = &self.lane {
            lane.flush();
        }
    }

    /// Flush pending learning, then write the skillbook atomically.
    pub fn save_skillbook(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.flush();
        let book = lock_book(&self.skillbook);
        save_skillbook(&self.settings.skillbook_path, &book)
    }

    pub fn skillbook_path(&self) -> Option<&Path> {
        self.is_enabled()
            .then_some(self.settings.skillbook_path.as_path())
    }

    /// Learning status for `agent-loop stats` and run summaries.
    pub fn get_stats(&self) -> Value {
        if !self.is_enabled() {
            return json!({ "enabled": false });
        }
        let book = lock_book(&self.skillbook);
        let top: Vec<Value> = book
            .top_skills(STATS_TOP_SKILLS)
            .into_iter()
            .map(|skill| {
                json!({
                    "id": skill.id,
                    "content": truncate_chars(&skill.content, STATS_CONTENT_CHARS),
                    "helpful": skill.helpful,
                    "harmful": skill.harmful,
                    "score": skill.score(),
                })
            })
            .collect();
        json!({
            "enabled": true,
            "model": self.settings.model,
            "skillbook_path": self.settings.skillbook_path.display().to_string(),
            "skill_count": book.len(),
            "max_skills": self.settings.max_skills,
            "async_learning": self.settings.async_learning,
            "top_skills": top,
        })
    }

    /// Drain the lane and stop its worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(lane) = &mut self.lane {
            lane.shutdown();
        }
        self.lane = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::skillbook::SkillOperation;
    use crate::learning::roles::{Reflection, SkillTag, SkillTagKind};
    use crate::test_support::{RecordingSink, ScriptedCurator, ScriptedReflector};
    use std::fs;

    fn settings(dir: &Path, async_learning: bool) -> LearningSettings {
        LearningSettings {
            enabled: true,
            model: "claude".to_string(),
            skillbook_path: dir.join("skillbook/skillbook.json"),
            async_learning,
            max_skills: 3,
            queue_capacity: 4,
        }
    }

    fn add(content: &str) -> SkillOperation {
        SkillOperation::Add {
            content: content.to_string(),
        }
    }

    fn recording_mux() -> (Arc<ObservabilityMultiplexer>, RecordingSink) {
        let sink = RecordingSink::new();
        let mux = ObservabilityMultiplexer::silent();
        mux.add_sink(Box::new(sink.clone()));
        (Arc::new(mux), sink)
    }

    #[test]
    fn disabled_adapter_is_inert() {
        let adapter = LearningAdapter::disabled(Arc::new(ObservabilityMultiplexer::silent()));
        assert_eq!(adapter.inject_context("task"), "task");
        adapter.learn_from_execution("task", "out", true, None);
        adapter.save_skillbook().expect("save");
        assert_eq!(adapter.get_stats(), json!({ "enabled": false }));
        assert!(adapter.skillbook_path().is_none());
    }

    #[test]
    fn empty_skillbook_leaves_prompt_unchanged() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(Vec::new())),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");
        assert_eq!(adapter.inject_context("do the thing\n"), "do the thing\n");
    }

    #[test]
    fn sync_learning_applies_update_and_injects() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(vec![SkillUpdate {
                reasoning: "r".to_string(),
                operations: vec![add("read the failing test first")],
            }])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");

        adapter.learn_from_execution("fix test", "fixed", true, None);
        assert_eq!(adapter.skill_count(), 1);
        let injected = adapter.inject_context("fix test\n");
        assert_eq!(
            injected,
            format!(
                "fix test\n\n{}",
                lock_book(&adapter.skillbook()).render_context()
            )
        );
        assert!(injected.contains("- [skill-00001] read the failing test first (helpful=0, harmful=0)"));
    }

    #[test]
    fn reflection_tags_are_applied_before_curation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reflector = ScriptedReflector::new(Reflection {
            reasoning: String::new(),
            key_insight: String::new(),
            skill_tags: vec![SkillTag {
                id: "skill-00001".to_string(),
                tag: SkillTagKind::Harmful,
            }],
        });
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(reflector),
            Box::new(ScriptedCurator::new(vec![SkillUpdate {
                reasoning: String::new(),
                operations: vec![add("a")],
            }])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");

        // The tag precedes the ADD that creates the skill, so it is skipped.
        adapter.learn_from_execution("t", "o", true, None);
        assert_eq!(
            lock_book(&adapter.skillbook()).get("skill-00001").expect("skill").harmful,
            0
        );

        adapter.learn_from_execution("t", "o", false, Some("boom"));
        assert_eq!(
            lock_book(&adapter.skillbook()).get("skill-00001").expect("skill").harmful,
            1
        );
    }

    #[test]
    fn async_learning_is_visible_after_flush() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut adapter = LearningAdapter::new(
            settings(temp.path(), true),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(vec![
                SkillUpdate {
                    reasoning: String::new(),
                    operations: vec![add("one")],
                },
                SkillUpdate {
                    reasoning: String::new(),
                    operations: vec![add("two")],
                },
            ])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");

        adapter.learn_from_execution("t1", "o", true, None);
        adapter.learn_from_execution("t2", "o", true, None);
        adapter.save_skillbook().expect("save");

        let saved: Skillbook = serde_json::from_str(
            &fs::read_to_string(&adapter.settings().skillbook_path).expect("read"),
        )
        .expect("parse");
        let contents: Vec<&str> = saved.skills.iter().map(|s| s.content.as_str()).collect();
        assert_eq!(contents, vec!["one", "two"]);
        adapter.shutdown();
        adapter.shutdown();
    }

    #[test]
    fn over_capacity_prunes_lowest_scores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(vec![SkillUpdate {
                reasoning: String::new(),
                operations: vec![add("a"), add("b"), add("c"), add("d")],
            }])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");
        adapter.learn_from_execution("t", "o", true, None);
        let book = adapter.skillbook();
        let ids: Vec<String> = lock_book(&book)
            .skills
            .iter()
            .map(|s| s.id.clone())
            .collect();
        // All scores tie at zero, so the oldest goes.
        assert_eq!(ids, vec!["skill-00002", "skill-00003", "skill-00004"]);
    }

    #[test]
    fn learning_failure_is_a_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mux, sink) = recording_mux();
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::failing("model offline")),
            Box::new(ScriptedCurator::new(Vec::new())),
            mux,
        )
        .expect("adapter");
        adapter.learn_from_execution("t", "o", true, None);

        assert_eq!(adapter.skill_count(), 0);
        let warning = sink
            .entries()
            .into_iter()
            .find(|entry| entry.level == LogLevel::Warn)
            .expect("warning");
        assert_eq!(warning.component, "Learning");
        assert!(warning.message.contains("model offline"));
    }

    struct PanickingReflector;

    impl Reflector for PanickingReflector {
        fn reflect(&self, _sample: &LearningSample, _skills: &[Skill]) -> Result<Reflection> {
            panic!("reflector blew up");
        }
    }

    #[test]
    fn panicking_reflector_is_contained_inline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let (mux, sink) = recording_mux();
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(PanickingReflector),
            Box::new(ScriptedCurator::new(Vec::new())),
            mux,
        )
        .expect("adapter");

        adapter.learn_from_execution("t1", "o", true, None);
        adapter.learn_from_execution("t2", "o", false, Some("boom"));

        assert_eq!(adapter.skill_count(), 0);
        let panics = sink
            .entries()
            .into_iter()
            .filter(|entry| entry.level == LogLevel::Warn && entry.message.contains("panicked"))
            .count();
        assert_eq!(panics, 2);
        adapter.save_skillbook().expect("save after panic");
    }

    #[test]
    fn oversized_skillbook_is_pruned_on_load() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path(), false);
        let mut book = Skillbook::new();
        for content in ["a", "b", "c", "d", "e"] {
            book.add(content, "2026-01-01T00:00:00Z");
        }
        book.apply_update(
            &SkillUpdate {
                reasoning: String::new(),
                operations: vec![SkillOperation::Tag {
                    id: "skill-00001".to_string(),
                    helpful: 2,
                    harmful: 0,
                }],
            },
            "2026-01-02T00:00:00Z",
        );
        fs::create_dir_all(settings.skillbook_path.parent().expect("parent")).expect("mkdir");
        save_skillbook(&settings.skillbook_path, &book).expect("seed");
        let (mux, sink) = recording_mux();

        let adapter = LearningAdapter::new(
            settings,
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(Vec::new())),
            mux,
        )
        .expect("adapter");

        assert_eq!(adapter.skill_count(), 3);
        let ids: Vec<String> = lock_book(&adapter.skillbook())
            .skills
            .iter()
            .map(|s| s.id.clone())
            .collect();
        assert_eq!(ids, vec!["skill-00001", "skill-00004", "skill-00005"]);
        assert!(
            sink.messages()
                .iter()
                .any(|m| m.contains("pruned skill-00002, skill-00003"))
        );
    }

    #[test]
    fn inputs_are_truncated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let reflector = ScriptedReflector::default();
        let seen = reflector.samples();
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(reflector),
            Box::new(ScriptedCurator::new(vec![SkillUpdate::default()])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");
        let long = "x".repeat(5000);
        adapter.learn_from_execution(&long, &long, false, Some(&long));

        let samples = seen.lock().expect("lock");
        let sample = &samples[0];
        assert_eq!(sample.question.chars().count(), 1000);
        assert_eq!(sample.context.chars().count(), 500);
        assert_eq!(sample.output.chars().count(), 2000);
        assert_eq!(sample.error.as_deref().map(str::len), Some(500));
    }

    #[test]
    fn corrupted_skillbook_recovers_with_warning() {
        let temp = tempfile::tempdir().expect("tempdir");
        let settings = settings(temp.path(), false);
        fs::create_dir_all(settings.skillbook_path.parent().expect("parent")).expect("mkdir");
        fs::write(&settings.skillbook_path, "not json").expect("write");
        let (mux, sink) = recording_mux();

        let adapter = LearningAdapter::new(
            settings,
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(Vec::new())),
            mux,
        )
        .expect("adapter");
        assert_eq!(adapter.skill_count(), 0);
        assert!(
            sink.entries()
                .iter()
                .any(|entry| entry.level == LogLevel::Warn && entry.message.contains("unreadable"))
        );
    }

    #[test]
    fn unwritable_skillbook_dir_fails_startup() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("skillbook"), "file, not dir").expect("write");
        let err = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(Vec::new())),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .err()
        .expect("startup error");
        assert!(
            err.downcast_ref::<crate::error::StartupError>()
                .is_some()
        );
    }

    #[test]
    fn stats_list_top_skills_by_score() {
        let temp = tempfile::tempdir().expect("tempdir");
        let adapter = LearningAdapter::new(
            settings(temp.path(), false),
            Box::new(ScriptedReflector::default()),
            Box::new(ScriptedCurator::new(vec![SkillUpdate {
                reasoning: String::new(),
                operations: vec![
                    add("low"),
                    add(&"y".repeat(150)),
                    SkillOperation::Tag {
                        id: "skill-00002".to_string(),
                        helpful: 3,
                        harmful: 0,
                    },
                ],
            }])),
            Arc::new(ObservabilityMultiplexer::silent()),
        )
        .expect("adapter");
        adapter.learn_from_execution("t", "o", true, None);

        let stats = adapter.get_stats();
        assert_eq!(stats["enabled"], true);
        assert_eq!(stats["skill_count"], 2);
        assert_eq!(stats["max_skills"], 3);
        assert_eq!(stats["async_learning"], false);
        assert_eq!(stats["top_skills"][0]["id"], "skill-00002");
        assert_eq!(
            stats["top_skills"][0]["content"]
                .as_str()
                .expect("content")
                .len(),
            100
        );
    }
}
