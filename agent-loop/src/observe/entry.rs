//! Structured log entries shared by every sink.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::types::LogLevel;

/// One structured event. Immutable once handed to the multiplexer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            iteration: None,
            context_tokens: None,
            metadata: None,
        }
    }

    pub fn with_iteration(mut self, iteration: u32) -> Self {
        self.iteration = Some(iteration);
        self
    }

    pub fn with_context_tokens(mut self, tokens: u64) -> Self {
        self.context_tokens = Some(tokens);
        self
    }

    /// Attach one metadata field.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    /// Replace the metadata map wholesale. Empty maps are dropped.
    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        self
    }

    /// Single JSONL line, no trailing newline.
    pub fn to_json_line(&self) -> String {
        let mut obj = Map::new();
        obj.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        obj.insert("level".into(), Value::String(self.level.as_str().into()));
        obj.insert("component".into(), Value::String(self.component.clone()));
        obj.insert("message".into(), Value::String(self.message.clone()));
        if let Some(iteration) = self.iteration {
            obj.insert("iteration".into(), Value::from(iteration));
        }
        if let Some(tokens) = self.context_tokens {
            obj.insert("context_tokens".into(), Value::from(tokens));
        }
        if let Some(metadata) = &self.metadata {
            obj.insert("metadata".into(), Value::Object(metadata.clone()));
        }
        Value::Object(obj).to_string()
    }

    /// Console rendering: `[HH:MM:SS] [LEVEL  ] component: message (iter=N, tokens=1,234)`.
    pub fn to_console_line(&self) -> String {
        let mut line = format!(
            "[{}] [{:<7}] {}: {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.as_str(),
            self.component,
            self.message
        );
        let mut extras = Vec::new();
        if let Some(iteration) = self.iteration {
            extras.push(format!("iter={iteration}"));
        }
        if let Some(tokens) = self.context_tokens {
            extras.push(format!("tokens={}", group_thousands(tokens)));
        }
        if !extras.is_empty() {
            line.push_str(&format!(" ({})", extras.join(", ")));
        }
        line
    }
}

/// `1234567` -> `1,234,567`.
pub fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (idx, ch) in digits.chars().enumerate() {
        if idx > 0 && (digits.len() - idx) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn fixed_entry() -> LogEntry {
        let mut entry = LogEntry::new(LogLevel::Info, "ContextTracker", "measured");
        entry.timestamp = Utc.with_ymd_and_hms(2026, 3, 4, 5, 6, 7).unwrap();
        entry
    }

    #[test]
    fn console_line_includes_iteration_and_tokens() {
        let entry = fixed_entry().with_iteration(3).with_context_tokens(1234);
        assert_eq!(
            entry.to_console_line(),
            "[05:06:07] [INFO   ] ContextTracker: measured (iter=3, tokens=1,234)"
        );
    }

    #[test]
    fn console_line_without_extras_has_no_suffix() {
        let mut entry = fixed_entry();
        entry.level = LogLevel::Critical;
        assert_eq!(
            entry.to_console_line(),
            "[05:06:07] [CRITICAL] ContextTracker: measured"
        );
    }

    #[test]
    fn json_line_omits_absent_fields() {
        let line = fixed_entry().to_json_line();
        let value: Value = serde_json::from_str(&line).expect("json");
        let obj = value.as_object().expect("object");
        assert_eq!(obj.len(), 4);
        assert_eq!(obj["level"], "INFO");
        assert_eq!(obj["timestamp"], "2026-03-04T05:06:07.000Z");
        assert!(!line.contains('\n'));
    }

    #[test]
    fn json_line_carries_metadata() {
        let line = fixed_entry()
            .with_iteration(1)
            .with_meta("tool", "bash")
            .to_json_line();
        let parsed: LogEntry = serde_json::from_str(&line).expect("parse back");
        assert_eq!(parsed.iteration, Some(1));
        assert_eq!(
            parsed.metadata.expect("metadata")["tool"],
            Value::String("bash".into())
        );
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(0), "0");
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(1000), "1,000");
        assert_eq!(group_thousands(1234567), "1,234,567");
    }
}
