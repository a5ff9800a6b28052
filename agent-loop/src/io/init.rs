//! Workspace layout under `.agent/` and the `init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};

use crate::core::skillbook::Skillbook;
use crate::io::atomic::write_json_atomic;
use crate::io::config::{AgentConfig, write_config};

/// Well-known paths for a workspace rooted at `root`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentPaths {
    pub root: PathBuf,
    pub agent_dir: PathBuf,
    pub state_dir: PathBuf,
    pub metrics_dir: PathBuf,
    pub coordination_dir: PathBuf,
    pub results_dir: PathBuf,
    pub iterations_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub checkpoint_path: PathBuf,
}

impl AgentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let agent_dir = root.join(".agent");
        let state_dir = agent_dir.join("state");
        let coordination_dir = agent_dir.join("coordination");
        Self {
            root: root.clone(),
            agent_dir: agent_dir.clone(),
            state_dir: state_dir.clone(),
            metrics_dir: agent_dir.join("metrics"),
            coordination_dir: coordination_dir.clone(),
            results_dir: coordination_dir.join("subagent-results"),
            iterations_dir: agent_dir.join("iterations"),
            gitignore_path: agent_dir.join(".gitignore"),
            config_path: agent_dir.join("config.toml"),
            checkpoint_path: state_dir.join("checkpoint.json"),
        }
    }

    /// Resolve a configured path. Relative paths are taken from the root.
    pub fn resolve(&self, configured: &str) -> PathBuf {
        let path = Path::new(configured);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Options for `init_workspace`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing loop-owned files.
    pub force: bool,
}

/// Create `.agent/` scaffolding in `root`.
///
/// Fails if `.agent/` already exists unless `options.force` is set. The prompt
/// file belongs to the user and is only created when missing.
pub fn init_workspace(root: &Path, options: &InitOptions) -> Result<AgentPaths> {
    let paths = AgentPaths::new(root);
    if paths.agent_dir.exists() && !options.force {
        return Err(anyhow!(
            "agent-loop init: .agent already exists (use --force to overwrite)"
        ));
    }
    if paths.agent_dir.exists() && !paths.agent_dir.is_dir() {
        return Err(anyhow!(
            "agent-loop init: .agent exists but is not a directory"
        ));
    }

    let cfg = AgentConfig::default();
    create_dir(&paths.agent_dir)?;
    create_dir(&paths.state_dir)?;
    create_dir(&paths.metrics_dir)?;
    create_dir(&paths.results_dir)?;
    create_dir(&paths.iterations_dir)?;
    create_dir(&paths.resolve(&cfg.logging.log_dir))?;

    fs::write(&paths.gitignore_path, AGENT_GITIGNORE)
        .with_context(|| format!("write file {}", paths.gitignore_path.display()))?;
    write_config(&paths.config_path, &cfg)?;
    write_json_atomic(&paths.resolve(&cfg.learning.skillbook_path), &Skillbook::new())?;

    let prompt_path = paths.resolve(&cfg.prompt_file);
    if !prompt_path.exists() {
        fs::write(&prompt_path, PROMPT_PLACEHOLDER)
            .with_context(|| format!("write file {}", prompt_path.display()))?;
    }

    Ok(paths)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

const PROMPT_PLACEHOLDER: &str = "# Task\n\nDescribe the work for the agent here. \
Print LOOP_COMPLETE when everything is done.\n";
const AGENT_GITIGNORE: &str = "logs/\nmetrics/\niterations/\ncoordination/\n";
