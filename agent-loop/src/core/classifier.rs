//! Deterministic classification of prompts into subagent types.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::SubagentType;

/// One row of the classification table.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationRule {
    pub subagent: SubagentType,
    pub keywords: &'static [&'static str],
}

/// Ordered rule table, most specific category first.
///
/// Keywords match at the start of a word, case-insensitively, so `debug`
/// also matches "debugging" but `test` does not match "latest".
pub const RULES: &[ClassificationRule] = &[
    ClassificationRule {
        subagent: SubagentType::Debugger,
        keywords: &[
            "debug",
            "crash",
            "bug",
            "exception",
            "traceback",
            "stack trace",
            "panic",
            "segfault",
            "regression",
            "broken",
            "fix",
        ],
    },
    ClassificationRule {
        subagent: SubagentType::Validator,
        keywords: &[
            "validate",
            "validation",
            "verify",
            "test",
            "check",
            "qa",
            "acceptance",
            "e2e",
        ],
    },
    ClassificationRule {
        subagent: SubagentType::Researcher,
        keywords: &[
            "research",
            "investigate",
            "explore",
            "look up",
            "find out",
            "compare",
            "survey",
        ],
    },
    ClassificationRule {
        subagent: SubagentType::Analyst,
        keywords: &[
            "analyze",
            "analyse",
            "analysis",
            "review",
            "audit",
            "assess",
            "evaluate",
            "profile",
            "metrics",
        ],
    },
];

/// Subagent used when no rule matches.
pub const DEFAULT_SUBAGENT: SubagentType = SubagentType::Implementer;

static RULE_PATTERNS: LazyLock<Vec<(SubagentType, Regex)>> = LazyLock::new(|| {
    RULES
        .iter()
        .map(|rule| {
            let alternatives = rule
                .keywords
                .iter()
                .map(|keyword| regex::escape(keyword))
                .collect::<Vec<_>>()
                .join("|");
            let pattern = format!(r"(?i)\b(?:{alternatives})");
            (
                rule.subagent,
                Regex::new(&pattern).expect("classifier keywords should form a valid regex"),
            )
        })
        .collect()
});

/// Classify a prompt. The first matching rule wins; there is no scoring.
pub fn classify_prompt(prompt: &str) -> SubagentType {
    RULE_PATTERNS
        .iter()
        .find(|(_, pattern)| pattern.is_match(prompt))
        .map(|(subagent, _)| *subagent)
        .unwrap_or(DEFAULT_SUBAGENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_prompt_is_debugger() {
        assert_eq!(classify_prompt("Debug the crash"), SubagentType::Debugger);
    }

    #[test]
    fn unmatched_prompt_defaults_to_implementer() {
        assert_eq!(
            classify_prompt("Build a new feature"),
            SubagentType::Implementer
        );
        assert_eq!(classify_prompt(""), SubagentType::Implementer);
    }

    #[test]
    fn earlier_rule_wins_when_several_match() {
        // debugger keywords beat validator and researcher keywords.
        assert_eq!(
            classify_prompt("Investigate why the tests crash"),
            SubagentType::Debugger
        );
        // validator beats analyst.
        assert_eq!(
            classify_prompt("Review and verify the migration"),
            SubagentType::Validator
        );
    }

    #[test]
    fn each_category_has_a_reachable_keyword() {
        assert_eq!(classify_prompt("Verify the login flow"), SubagentType::Validator);
        assert_eq!(
            classify_prompt("Research caching libraries"),
            SubagentType::Researcher
        );
        assert_eq!(
            classify_prompt("Analyze the latency histogram"),
            SubagentType::Analyst
        );
    }

    #[test]
    fn keywords_match_word_starts_only() {
        assert_eq!(
            classify_prompt("Ship the latest release"),
            SubagentType::Implementer
        );
        assert_eq!(
            classify_prompt("DEBUGGING session needed"),
            SubagentType::Debugger
        );
    }

    #[test]
    fn multi_word_keywords_match() {
        assert_eq!(
            classify_prompt("Read the stack trace and report"),
            SubagentType::Debugger
        );
        assert_eq!(
            classify_prompt("Find out which crate owns this"),
            SubagentType::Researcher
        );
    }

    #[test]
    fn rule_table_order_is_pinned() {
        let order: Vec<SubagentType> = RULES.iter().map(|rule| rule.subagent).collect();
        assert_eq!(
            order,
            vec![
                SubagentType::Debugger,
                SubagentType::Validator,
                SubagentType::Researcher,
                SubagentType::Analyst,
            ]
        );
    }
}
