//! Files shared between the loop and its subagents under `.agent/coordination/`.
//!
//! - `current-attempt.json`: the attempt in progress
//! - `shared-context.md`: context every subagent reads first
//! - `attempt-journal.md`: append-only history of attempts
//! - `subagent-results/<type>-<id>.json`: one write-once record per subagent

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::{SubagentType, Verdict};
use crate::io::atomic::{write_atomic, write_json_atomic};

const JOURNAL_HEADER: &str = "# Attempt Journal\n\nRecord of all attempts during this run.\n";

/// Record of one subagent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubagentResult {
    pub subagent_type: SubagentType,
    pub subagent_id: String,
    pub success: bool,
    pub verdict: Verdict,
    pub stdout: String,
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parsed_json: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl SubagentResult {
    pub fn file_name(&self) -> String {
        format!("{}-{}.json", self.subagent_type, self.subagent_id)
    }
}

/// Contents of `current-attempt.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptInfo {
    pub attempt_number: u32,
    pub phase: String,
    pub criteria: Vec<String>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CoordinationStore {
    dir: PathBuf,
    results_dir: PathBuf,
}

impl CoordinationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            results_dir: dir.join("subagent-results"),
            dir,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn attempt_path(&self) -> PathBuf {
        self.dir.join("current-attempt.json")
    }

    pub fn shared_context_path(&self) -> PathBuf {
        self.dir.join("shared-context.md")
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join("attempt-journal.md")
    }

    /// Start a new attempt: record it and clear results of earlier attempts.
    pub fn begin_attempt(
        &self,
        attempt_number: u32,
        phase: &str,
        criteria: &[String],
    ) -> Result<AttemptInfo> {
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("create {}", self.results_dir.display()))?;
        let mut cleared = 0usize;
        for entry in fs::read_dir(&self.results_dir)
            .with_context(|| format!("read dir {}", self.results_dir.display()))?
        {
            let path = entry
                .with_context(|| format!("read dir entry in {}", self.results_dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                fs::remove_file(&path).with_context(|| format!("remove {}", path.display()))?;
                cleared += 1;
            }
        }

        let info = AttemptInfo {
            attempt_number,
            phase: phase.to_string(),
            criteria: criteria.to_vec(),
            started_at: Utc::now(),
        };
        write_json_atomic(&self.attempt_path(), &info)?;
        debug!(attempt_number, cleared, "attempt started");
        Ok(info)
    }

    pub fn current_attempt(&self) -> Result<Option<AttemptInfo>> {
        let path = self.attempt_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents =
            fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
        let info = serde_json::from_str(&contents)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(Some(info))
    }

    /// Replace `shared-context.md` with the given sections, in order.
    pub fn write_shared_context(&self, sections: &[(&str, &str)]) -> Result<PathBuf> {
        let mut buf = String::from("# Shared Context\n\n");
        buf.push_str(&format!(
            "Last updated: {}\n\n",
            Local::now().format("%Y-%m-%d %H:%M:%S")
        ));
        for (key, value) in sections {
            buf.push_str(&format!("## {key}\n\n{}\n\n", value.trim_end()));
        }
        let path = self.shared_context_path();
        write_atomic(&path, &buf)?;
        Ok(path)
    }

    /// Append an entry for `attempt_number`, creating the journal on first use.
    pub fn append_to_journal(&self, attempt_number: u32, entry: &str) -> Result<PathBuf> {
        let path = self.journal_path();
        fs::create_dir_all(&self.dir).with_context(|| format!("create {}", self.dir.display()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        let is_new = file
            .metadata()
            .with_context(|| format!("stat {}", path.display()))?
            .len()
            == 0;
        let mut buf = String::new();
        if is_new {
            buf.push_str(JOURNAL_HEADER);
        }
        buf.push_str(&format!(
            "\n## Attempt {attempt_number} - {}\n\n{}\n",
            Local::now().format("%Y-%m-%d %H:%M:%S"),
            entry.trim_end()
        ));
        file.write_all(buf.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        Ok(path)
    }

    /// Write a result record. Each record can be written only once.
    pub fn write_result(&self, result: &SubagentResult) -> Result<PathBuf> {
        fs::create_dir_all(&self.results_dir)
            .with_context(|| format!("create {}", self.results_dir.display()))?;
        let path = self.results_dir.join(result.file_name());
        let mut payload = serde_json::to_string_pretty(result).context("serialize result")?;
        payload.push('\n');
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(anyhow!("result {} already recorded", path.display()));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("create {}", path.display()));
            }
        };
        file.write_all(payload.as_bytes())
            .with_context(|| format!("write {}", path.display()))?;
        Ok(path)
    }

    /// Every readable result record, ordered by file name.
    pub fn collect_results(&self) -> Result<Vec<SubagentResult>> {
        if !self.results_dir.exists() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.results_dir)
            .with_context(|| format!("read dir {}", self.results_dir.display()))?
        {
            let path = entry
                .with_context(|| format!("read dir entry in {}", self.results_dir.display()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut results = Vec::with_capacity(paths.len());
        for path in &paths {
            let parsed = fs::read_to_string(path)
                .map_err(anyhow::Error::from)
                .and_then(|contents| {
                    serde_json::from_str::<SubagentResult>(&contents).map_err(anyhow::Error::from)
                });
            match parsed {
                Ok(result) => results.push(result),
                Err(err) => warn!(path = %path.display(), err = %err, "skipping unreadable subagent result"),
            }
        }
        Ok(results)
    }
}
