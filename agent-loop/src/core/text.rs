//! Small text helpers shared by log previews, learning prompts and
//! subagent output parsing.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

static CHECKLIST_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:[-*+]|\d+[.)])\s+(?:\[[ xX]?\]\s*)?(\S.*)$")
        .expect("checklist regex should be valid")
});

/// First `max_chars` characters of `text`, never splitting a code point.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// The last top-level JSON object embedded in free-form agent output.
///
/// Candidates are tried from the end. An object followed by `,`, `]` or `}`
/// is a value inside a larger document and is skipped in favour of its
/// enclosing object.
pub fn last_json_object(text: &str) -> Option<Map<String, Value>> {
    let mut end = text.len();
    while let Some(start) = text[..end].rfind('{') {
        end = start;
        let mut stream = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
        let Some(Ok(Value::Object(map))) = stream.next() else {
            continue;
        };
        let rest = text[start + stream.byte_offset()..].trim_start();
        if !rest.starts_with([',', ']', '}']) {
            return Some(map);
        }
    }
    None
}

/// Bullet, numbered or checkbox items of a markdown prompt, in order.
///
/// Falls back to the first non-blank line when the prompt has no list.
pub fn checklist_items(text: &str) -> Vec<String> {
    let items: Vec<String> = text
        .lines()
        .filter_map(|line| CHECKLIST_ITEM.captures(line))
        .filter_map(|caps| caps.get(1))
        .map(|item| item.as_str().trim().to_string())
        .collect();
    if !items.is_empty() {
        return items;
    }
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| vec![line.trim_start_matches('#').trim().to_string()])
        .unwrap_or_default()
}
