//! Shared deterministic types for the loop core.
//!
//! These types define stable contracts between components and the files they
//! write (JSONL logs, timelines, subagent records). Serialized spellings are
//! part of the on-disk format.

use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Severity of a structured log entry.
///
/// Numeric values match the conventional logging levels so entries can be
/// filtered with a single comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    #[serde(alias = "debug")]
    Debug = 10,
    #[serde(alias = "info")]
    Info = 20,
    #[serde(rename = "WARNING", alias = "warning", alias = "WARN", alias = "warn")]
    Warn = 30,
    #[serde(alias = "error")]
    Error = 40,
    #[serde(alias = "critical")]
    Critical = 50,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(LogLevel::Debug),
            "INFO" => Ok(LogLevel::Info),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            "CRITICAL" => Ok(LogLevel::Critical),
            other => Err(anyhow!("unknown log level '{other}'")),
        }
    }
}

/// Named checkpoint within an iteration where context usage is sampled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurePoint {
    IterationStart,
    AfterPromptInject,
    AfterSkillbookInject,
    AfterToolCall,
    AfterResponse,
    IterationEnd,
}

impl MeasurePoint {
    pub fn as_str(self) -> &'static str {
        match self {
            MeasurePoint::IterationStart => "iteration_start",
            MeasurePoint::AfterPromptInject => "after_prompt_inject",
            MeasurePoint::AfterSkillbookInject => "after_skillbook_inject",
            MeasurePoint::AfterToolCall => "after_tool_call",
            MeasurePoint::AfterResponse => "after_response",
            MeasurePoint::IterationEnd => "iteration_end",
        }
    }

    /// Human label used in the ASCII timeline ("Iteration Start").
    pub fn title(self) -> String {
        self.as_str()
            .split('_')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Four-tier context usage indicator.
///
/// Boundaries are inclusive on the upper tier: exactly 50% is `Elevated`,
/// exactly 80% is `High`, exactly 95% is `Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageTier {
    Low,
    Elevated,
    High,
    Critical,
}

impl UsageTier {
    pub fn from_percentage(percentage: f64) -> Self {
        if percentage < 50.0 {
            UsageTier::Low
        } else if percentage < 80.0 {
            UsageTier::Elevated
        } else if percentage < 95.0 {
            UsageTier::High
        } else {
            UsageTier::Critical
        }
    }

    pub fn indicator(self) -> &'static str {
        match self {
            UsageTier::Low => "🟢",
            UsageTier::Elevated => "🟡",
            UsageTier::High => "🟠",
            UsageTier::Critical => "🔴",
        }
    }
}

/// Category of delegated work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubagentType {
    Debugger,
    Validator,
    Researcher,
    Analyst,
    Implementer,
}

impl SubagentType {
    pub const ALL: [SubagentType; 5] = [
        SubagentType::Debugger,
        SubagentType::Validator,
        SubagentType::Researcher,
        SubagentType::Analyst,
        SubagentType::Implementer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SubagentType::Debugger => "debugger",
            SubagentType::Validator => "validator",
            SubagentType::Researcher => "researcher",
            SubagentType::Analyst => "analyst",
            SubagentType::Implementer => "implementer",
        }
    }
}

impl fmt::Display for SubagentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubagentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        SubagentType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| anyhow!("unknown subagent type '{s}'"))
    }
}

/// Verdict of a single subagent or of an aggregated delegation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    /// Aggregation found no recorded results.
    NoResults,
}

impl Verdict {
    pub fn as_str(self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::NoResults => "NO_RESULTS",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
