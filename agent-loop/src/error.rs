//! Errors callers need to tell apart.
//!
//! Everything else travels as `anyhow::Error`. These types are attached to
//! (or wrapped by) an `anyhow::Error` and recovered with `downcast_ref`.

use std::path::PathBuf;

use thiserror::Error;

use crate::core::types::SubagentType;

/// Delegation could not be attempted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrchestrationError {
    #[error(
        "subagent '{subagent}' cannot run: missing capabilities [{}], disabled capabilities [{}]; configure them in {} or disable orchestration",
        .missing.join(", "),
        .disabled.join(", "),
        .registry.display()
    )]
    MissingCapabilities {
        subagent: SubagentType,
        missing: Vec<String>,
        disabled: Vec<String>,
        registry: PathBuf,
    },

    #[error("unknown subagent type '{0}'")]
    UnknownSubagentType(String),
}

/// The loop cannot start safely.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("skillbook directory {} is not writable: {source}", .path.display())]
    SkillbookNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
