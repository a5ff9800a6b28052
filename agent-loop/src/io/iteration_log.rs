//! Per-iteration artifacts under `.agent/iterations/<run_id>/<n>/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::types::{SubagentType, Verdict};
use crate::io::atomic::write_json_atomic;

/// How an iteration's work was carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Direct,
    Delegated,
}

/// Closed record of one iteration (`meta.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    pub run_id: String,
    pub iteration: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subagent: Option<SubagentType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Skill count after learning minus skill count before injection.
    /// Async learning may still be pending when the record is written.
    pub learning_delta: i64,
    pub completion_detected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct IterationPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub output_path: PathBuf,
}

impl IterationPaths {
    pub fn new(iterations_dir: &Path, run_id: &str, iteration: u32) -> Self {
        let dir = iterations_dir.join(run_id).join(iteration.to_string());
        Self {
            dir: dir.clone(),
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            output_path: dir.join("output.txt"),
        }
    }
}

/// Write the prompt snapshot, agent output and metadata for one iteration.
pub fn write_iteration(
    iterations_dir: &Path,
    record: &IterationRecord,
    prompt: &str,
    output: &str,
) -> Result<IterationPaths> {
    let paths = IterationPaths::new(iterations_dir, &record.run_id, record.iteration);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create iteration dir {}", paths.dir.display()))?;

    // Metadata last, so a present meta.json implies the other files exist.
    write_text(&paths.prompt_path, prompt)?;
    write_text(&paths.output_path, output)?;
    write_json_atomic(&paths.meta_path, record)?;
    Ok(paths)
}

/// Load every `meta.json` of a run, ordered by iteration.
pub fn load_iterations(iterations_dir: &Path, run_id: &str) -> Result<Vec<IterationRecord>> {
    let run_dir = iterations_dir.join(run_id);
    if !run_dir.exists() {
        return Ok(Vec::new());
    }
    let mut records = Vec::new();
    for entry in
        fs::read_dir(&run_dir).with_context(|| format!("read dir {}", run_dir.display()))?
    {
        let meta_path = entry
            .with_context(|| format!("read dir entry in {}", run_dir.display()))?
            .path()
            .join("meta.json");
        if !meta_path.is_file() {
            continue;
        }
        let contents = fs::read_to_string(&meta_path)
            .with_context(|| format!("read {}", meta_path.display()))?;
        let record: IterationRecord = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", meta_path.display()))?;
        records.push(record);
    }
    records.sort_by_key(|record| record.iteration);
    Ok(records)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
