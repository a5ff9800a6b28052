//! Registry of external capabilities (MCP servers) available to subagents.
//!
//! Read from a JSON file with an `mcpServers` map. A server entry may carry
//! `"disabled": true`; any other fields are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityStatus {
    Enabled,
    Disabled,
    NotConfigured,
}

impl CapabilityStatus {
    pub fn label(self) -> &'static str {
        match self {
            CapabilityStatus::Enabled => "enabled",
            CapabilityStatus::Disabled => "disabled",
            CapabilityStatus::NotConfigured => "not configured",
        }
    }
}

/// Required capabilities that are unusable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityGap {
    pub missing: Vec<String>,
    pub disabled: Vec<String>,
}

impl CapabilityGap {
    pub fn is_empty(&self) -> bool {
        self.missing.is_empty() && self.disabled.is_empty()
    }
}

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, ServerEntry>,
}

#[derive(Deserialize)]
struct ServerEntry {
    #[serde(default)]
    disabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRegistry {
    source: PathBuf,
    /// Server name to enabled flag.
    servers: BTreeMap<String, bool>,
}

impl CapabilityRegistry {
    /// Load the registry. A missing file is an empty registry.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no capability registry, nothing available");
            return Ok(Self {
                source: path.to_path_buf(),
                servers: BTreeMap::new(),
            });
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("read capability registry {}", path.display()))?;
        let file: RegistryFile = serde_json::from_str(&contents)
            .with_context(|| format!("parse capability registry {}", path.display()))?;
        let servers = file
            .mcp_servers
            .into_iter()
            .map(|(name, entry)| (name, !entry.disabled))
            .collect();
        Ok(Self {
            source: path.to_path_buf(),
            servers,
        })
    }

    /// In-memory registry from `(name, enabled)` pairs.
    pub fn from_entries<I, S>(source: impl Into<PathBuf>, entries: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            source: source.into(),
            servers: entries
                .into_iter()
                .map(|(name, enabled)| (name.into(), enabled))
                .collect(),
        }
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn status(&self, name: &str) -> CapabilityStatus {
        match self.servers.get(name) {
            Some(true) => CapabilityStatus::Enabled,
            Some(false) => CapabilityStatus::Disabled,
            None => CapabilityStatus::NotConfigured,
        }
    }

    /// Which of `required` cannot be used, in the order given.
    pub fn gap(&self, required: &[&str]) -> CapabilityGap {
        let mut gap = CapabilityGap::default();
        for name in required {
            match self.status(name) {
                CapabilityStatus::Enabled => {}
                CapabilityStatus::Disabled => gap.disabled.push((*name).to_string()),
                CapabilityStatus::NotConfigured => gap.missing.push((*name).to_string()),
            }
        }
        gap
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.servers.keys().map(String::as_str)
    }
}
