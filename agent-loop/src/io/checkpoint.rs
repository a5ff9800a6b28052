//! Run checkpoint storage (`.agent/state/checkpoint.json`).

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::io::atomic::write_json_atomic;

/// Loop bookkeeping persisted at every checkpoint and at shutdown.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    /// Identifier of the run that wrote this checkpoint.
    pub run_id: Option<String>,
    /// Next iteration number (1-indexed).
    pub next_iteration: u32,
    pub successes: u32,
    pub failures: u32,
    pub consecutive_failures: u32,
    /// Whether the most recent iteration succeeded.
    pub last_success: Option<bool>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            run_id: None,
            next_iteration: 1,
            successes: 0,
            failures: 0,
            consecutive_failures: 0,
            last_success: None,
            updated_at: None,
        }
    }
}

/// Load a checkpoint. Missing file means no previous run.
pub fn load_checkpoint(path: &Path) -> Result<Option<Checkpoint>> {
    if !path.exists() {
        return Ok(None);
    }
    debug!(path = %path.display(), "loading checkpoint");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let checkpoint: Checkpoint = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    Ok(Some(checkpoint))
}

/// Atomically write a checkpoint (temp file + rename).
pub fn write_checkpoint(path: &Path, checkpoint: &Checkpoint) -> Result<()> {
    debug!(
        path = %path.display(),
        run_id = ?checkpoint.run_id,
        next_iteration = checkpoint.next_iteration,
        "writing checkpoint"
    );
    write_json_atomic(path, checkpoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/checkpoint.json");
        let checkpoint = Checkpoint {
            run_id: Some("run-1".to_string()),
            next_iteration: 6,
            successes: 4,
            failures: 1,
            consecutive_failures: 0,
            last_success: Some(true),
            updated_at: Some(Utc::now()),
        };
        write_checkpoint(&path, &checkpoint).expect("write");
        assert_eq!(load_checkpoint(&path).expect("load"), Some(checkpoint));
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(
            load_checkpoint(&temp.path().join("checkpoint.json"))
                .expect("load")
                .is_none()
        );
    }

    /// Guards the on-disk field order and default values.
    #[test]
    fn default_checkpoint_is_deterministic() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("checkpoint.json");
        write_checkpoint(&path, &Checkpoint::default()).expect("write");
        let contents = fs::read_to_string(&path).expect("read");
        let expected = "{\n  \"run_id\": null,\n  \"next_iteration\": 1,\n  \"successes\": 0,\n  \"failures\": 0,\n  \"consecutive_failures\": 0,\n  \"last_success\": null,\n  \"updated_at\": null\n}\n";
        assert_eq!(contents, expected);
    }
}
