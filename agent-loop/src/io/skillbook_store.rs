//! Skillbook persistence: atomic saves and recovery from corrupted files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::core::skillbook::Skillbook;
use crate::error::StartupError;
use crate::io::atomic::write_json_atomic;

/// Outcome of loading a skillbook from disk.
#[derive(Debug)]
pub struct LoadedSkillbook {
    pub skillbook: Skillbook,
    /// Where an unreadable file was moved before starting fresh.
    pub recovered_backup: Option<PathBuf>,
}

/// Load the skillbook at `path`.
///
/// A missing file yields an empty skillbook. A file that does not parse is
/// renamed to `<name>.corrupt-YYYYmmdd-HHMMSS.bak` and an empty skillbook is
/// returned; only I/O failures are errors.
pub fn load_skillbook(path: &Path) -> Result<LoadedSkillbook> {
    if !path.exists() {
        debug!(path = %path.display(), "no skillbook yet, starting empty");
        return Ok(LoadedSkillbook {
            skillbook: Skillbook::new(),
            recovered_backup: None,
        });
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read skillbook {}", path.display()))?;
    match serde_json::from_str::<Skillbook>(&contents) {
        Ok(skillbook) => {
            debug!(path = %path.display(), skills = skillbook.len(), "skillbook loaded");
            Ok(LoadedSkillbook {
                skillbook,
                recovered_backup: None,
            })
        }
        Err(err) => {
            let backup = corrupt_backup_path(path);
            fs::rename(path, &backup).with_context(|| {
                format!(
                    "move corrupted skillbook {} to {}",
                    path.display(),
                    backup.display()
                )
            })?;
            warn!(path = %path.display(), backup = %backup.display(), err = %err, "corrupted skillbook moved aside");
            Ok(LoadedSkillbook {
                skillbook: Skillbook::new(),
                recovered_backup: Some(backup),
            })
        }
    }
}

/// Read the skillbook without recovering a corrupted file. `None` when the
/// file does not exist.
pub fn read_skillbook(path: &Path) -> Result<Option<Skillbook>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read skillbook {}", path.display()))?;
    let skillbook = serde_json::from_str(&contents)
        .with_context(|| format!("parse skillbook {}", path.display()))?;
    Ok(Some(skillbook))
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".corrupt-{stamp}.bak"));
    let candidate = PathBuf::from(&name);
    if !candidate.exists() {
        return candidate;
    }
    // Two recoveries within the same second.
    name.push(format!(".{}", Uuid::new_v4().simple()));
    PathBuf::from(name)
}

/// Atomically write the skillbook (temp file + rename).
pub fn save_skillbook(path: &Path, skillbook: &Skillbook) -> Result<()> {
    debug!(path = %path.display(), skills = skillbook.len(), "saving skillbook");
    write_json_atomic(path, skillbook)
}

/// Create the skillbook directory and prove it accepts writes.
pub fn ensure_writable_dir(skillbook_path: &Path) -> Result<(), StartupError> {
    let dir = skillbook_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let not_writable = |source| StartupError::SkillbookNotWritable {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(not_writable)?;
    let probe = dir.join(format!(".write-probe-{}", Uuid::new_v4().simple()));
    fs::write(&probe, b"").map_err(not_writable)?;
    fs::remove_file(&probe).map_err(not_writable)?;
    Ok(())
}
