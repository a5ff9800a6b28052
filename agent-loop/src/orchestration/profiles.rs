//! Static subagent profiles: role text, capabilities and skills per type.

use crate::core::types::SubagentType;

#[derive(Debug, Clone, Copy)]
pub struct SubagentProfile {
    pub kind: SubagentType,
    pub role: &'static str,
    /// Capabilities that must be configured and enabled before spawning.
    pub required_capabilities: &'static [&'static str],
    /// Listed in the prompt with their status; never block a spawn.
    pub optional_capabilities: &'static [&'static str],
    pub required_skills: &'static [&'static str],
}

pub const PROFILES: &[SubagentProfile] = &[
    SubagentProfile {
        kind: SubagentType::Debugger,
        role: "You are a debugging specialist. Reproduce the failure, isolate the root cause \
               and confirm the fix with the smallest change that works.",
        required_capabilities: &["sequential-thinking"],
        optional_capabilities: &["context7"],
        required_skills: &["systematic-debugging"],
    },
    SubagentProfile {
        kind: SubagentType::Validator,
        role: "You are a validation specialist. Exercise the feature for real, record what you \
               observed and never accept a criterion without evidence.",
        required_capabilities: &["playwright"],
        optional_capabilities: &["context7"],
        required_skills: &["evidence-based-validation"],
    },
    SubagentProfile {
        kind: SubagentType::Researcher,
        role: "You are a research specialist. Gather current, sourced information and summarize \
               what matters for the task.",
        required_capabilities: &["tavily"],
        optional_capabilities: &["context7", "fetch"],
        required_skills: &["source-verification"],
    },
    SubagentProfile {
        kind: SubagentType::Analyst,
        role: "You are an analysis specialist. Break the problem down, weigh the options and \
               recommend one with its trade-offs.",
        required_capabilities: &["sequential-thinking"],
        optional_capabilities: &["tavily"],
        required_skills: &["structured-analysis"],
    },
    SubagentProfile {
        kind: SubagentType::Implementer,
        role: "You are an implementation specialist. Make the change, keep it minimal and prove \
               it works with tests.",
        required_capabilities: &[],
        optional_capabilities: &["context7"],
        required_skills: &["test-driven-development"],
    },
];

/// Profile for `kind`. Every subagent type has exactly one.
pub fn profile_for(kind: SubagentType) -> &'static SubagentProfile {
    PROFILES
        .iter()
        .find(|profile| profile.kind == kind)
        .unwrap_or(&PROFILES[PROFILES.len() - 1])
}
