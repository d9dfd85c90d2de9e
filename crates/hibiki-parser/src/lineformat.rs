// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line-mode reply format recovery.
//!
//! Models asked for `jsonline{"<n>": "<text>"}` replies drift: code fences,
//! bare JSON objects, alternative key names, plain arrays.  These helpers
//! recover a `{line_id → text}` map plus an ordered fallback list from
//! whatever came back, and pick the line a policy should judge.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;

pub const DEFAULT_TAGGED_PATTERN: &str = r"^@@(?P<id>\d+)@@(?P<text>.*)$";

const CODE_FENCE_MARKERS: [&str; 3] = ["```", "'''", "\"\"\""];
const ID_KEYS: [&str; 5] = ["id", "line", "line_id", "line_number", "index"];
const TEXT_KEYS: [&str; 4] = ["text", "translation", "value", "output"];

fn fence_block_patterns() -> &'static [Regex; 3] {
    static PATTERNS: OnceLock<[Regex; 3]> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            Regex::new(r"(?is)```(?:jsonl|json|text)?\s*([\s\S]*?)```").unwrap(),
            Regex::new(r"(?is)'''(?:jsonl|json|text)?\s*([\s\S]*?)'''").unwrap(),
            Regex::new(r#"(?is)"""(?:jsonl|json|text)?\s*([\s\S]*?)""""#).unwrap(),
        ]
    })
}

fn strip_code_fence(text: &str) -> String {
    let cleaned = text.trim();
    for pattern in fence_block_patterns() {
        if let Some(caps) = pattern.captures(cleaned) {
            return caps.get(1).unwrap().as_str().trim().to_string();
        }
    }
    for marker in CODE_FENCE_MARKERS {
        if cleaned.len() >= marker.len() * 2
            && cleaned.starts_with(marker)
            && cleaned.ends_with(marker)
        {
            return cleaned[marker.len()..cleaned.len() - marker.len()]
                .trim()
                .to_string();
        }
    }
    cleaned.to_string()
}

/// First balanced `{...}` / `[...]` block, string-literal aware.
fn extract_first_json_block(text: &str) -> Option<&str> {
    let mut start = None;
    let mut stack: Vec<char> = Vec::new();
    let mut in_str = false;
    let mut escape = false;
    for (idx, ch) in text.char_indices() {
        if in_str {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_str = false;
            }
            continue;
        }
        match ch {
            '"' => in_str = true,
            '{' | '[' => {
                if stack.is_empty() {
                    start = Some(idx);
                }
                stack.push(ch);
            }
            '}' | ']' => {
                let Some(opening) = stack.last().copied() else {
                    continue;
                };
                if (opening == '{' && ch == '}') || (opening == '[' && ch == ']') {
                    stack.pop();
                    if stack.is_empty() {
                        if let Some(s) = start {
                            return Some(&text[s..idx + ch.len_utf8()]);
                        }
                    }
                } else {
                    stack.pop();
                }
            }
            _ => {}
        }
    }
    None
}

fn try_parse_json(text: &str) -> Option<serde_json::Value> {
    let cleaned = strip_code_fence(text);
    if !cleaned.is_empty() {
        if let Ok(value) = serde_json::from_str(&cleaned) {
            return Some(value);
        }
    }
    let extracted = extract_first_json_block(&cleaned)?;
    serde_json::from_str(extracted).ok()
}

fn value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// `(line_id, text)` from one reply object, or `None` when the object does
/// not carry an id.
fn extract_entry_from_object(
    map: &serde_json::Map<String, serde_json::Value>,
) -> Option<(String, String)> {
    if map.len() == 1 {
        let (key, value) = map.iter().next().unwrap();
        if !TEXT_KEYS.contains(&key.to_ascii_lowercase().as_str()) {
            return Some((key.clone(), value_to_text(value)));
        }
    }
    let line_id = ID_KEYS.iter().find_map(|k| map.get(*k))?;
    let text = TEXT_KEYS.iter().find_map(|k| map.get(*k))?;
    Some((value_to_text(line_id), value_to_text(text)))
}

fn push_object(
    map: &serde_json::Map<String, serde_json::Value>,
    entries: &mut HashMap<String, String>,
    ordered: &mut Vec<String>,
) {
    if let Some((line_id, text)) = extract_entry_from_object(map) {
        entries.insert(line_id, text);
        return;
    }
    for key in ["translation", "text"] {
        if let Some(value) = map.get(key) {
            ordered.push(value_to_text(value));
            return;
        }
    }
}

/// Recover `{line_id → text}` entries and an ordered fallback list from a
/// line-mode reply.
pub fn parse_jsonl_entries(text: &str) -> (HashMap<String, String>, Vec<String>) {
    let mut entries = HashMap::new();
    let mut ordered = Vec::new();

    for raw in text.lines() {
        let mut line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if CODE_FENCE_MARKERS.iter().any(|m| line.starts_with(m)) {
            continue;
        }
        if line.len() >= 8 && line.is_char_boundary(8) && line[..8].eq_ignore_ascii_case("jsonline") {
            line = line[8..].trim();
        }
        if line.is_empty() {
            continue;
        }
        let Some(data) = try_parse_json(line) else {
            continue;
        };
        match data {
            serde_json::Value::Object(map) => push_object(&map, &mut entries, &mut ordered),
            serde_json::Value::Array(items) => {
                ordered.extend(items.iter().map(value_to_text));
            }
            _ => {}
        }
    }

    if !entries.is_empty() || !ordered.is_empty() {
        return (entries, ordered);
    }

    // Per-line recovery found nothing: try the payload as one JSON document.
    match try_parse_json(text) {
        Some(serde_json::Value::Object(map)) => {
            if let Some((line_id, value)) = extract_entry_from_object(&map) {
                entries.insert(line_id, value);
            } else {
                for key in ["translation", "text"] {
                    if let Some(value) = map.get(key) {
                        ordered.push(value_to_text(value));
                        break;
                    }
                }
            }
        }
        Some(serde_json::Value::Array(items)) => {
            ordered.extend(items.iter().map(value_to_text));
        }
        _ => {}
    }
    (entries, ordered)
}

/// `{line_id → text}` from `@@id@@text` style replies.
pub fn parse_tagged_entries(text: &str, pattern: Option<&str>) -> HashMap<String, String> {
    static DEFAULT: OnceLock<Regex> = OnceLock::new();
    let compiled_storage;
    let compiled = match pattern {
        None => DEFAULT.get_or_init(|| Regex::new(DEFAULT_TAGGED_PATTERN).unwrap()),
        Some(p) => match Regex::new(p) {
            Ok(re) => {
                compiled_storage = re;
                &compiled_storage
            }
            Err(_) => return HashMap::new(),
        },
    };
    let mut entries = HashMap::new();
    for raw in text.lines() {
        let Some(caps) = compiled.captures(raw.trim()) else {
            continue;
        };
        let line_id = caps
            .name("id")
            .map(|m| m.as_str())
            .or_else(|| caps.get(1).map(|m| m.as_str()));
        let value = caps
            .name("text")
            .map(|m| m.as_str())
            .or_else(|| caps.get(2).map(|m| m.as_str()));
        if let (Some(line_id), Some(value)) = (line_id, value) {
            entries.insert(line_id.to_string(), value.to_string());
        }
    }
    entries
}

/// Pick the translated line for `line_index` out of a line-mode reply:
/// JSONL map first (1-based key, then 0-based), then the ordered fallback,
/// then tagged-line entries.
pub fn extract_line_for_policy(
    text: &str,
    line_index: usize,
    tagged_pattern: Option<&str>,
) -> Option<String> {
    let (entries, ordered) = parse_jsonl_entries(text);
    if !entries.is_empty() {
        if let Some(value) = entries.get(&(line_index + 1).to_string()) {
            return Some(value.clone());
        }
        if let Some(value) = entries.get(&line_index.to_string()) {
            return Some(value.clone());
        }
    }
    if !ordered.is_empty() {
        if ordered.len() == 1 {
            return Some(ordered[0].clone());
        }
        if line_index < ordered.len() {
            return Some(ordered[line_index].clone());
        }
    }

    let tagged = parse_tagged_entries(text, tagged_pattern);
    if !tagged.is_empty() {
        if let Some(value) = tagged.get(&(line_index + 1).to_string()) {
            return Some(value.clone());
        }
        if let Some(value) = tagged.get(&line_index.to_string()) {
            return Some(value.clone());
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jsonline_prefixed_entries() {
        let (entries, ordered) =
            parse_jsonl_entries("jsonline{\"1\": \"alpha\"}\njsonline{\"2\": \"beta\"}");
        assert_eq!(entries.get("1").unwrap(), "alpha");
        assert_eq!(entries.get("2").unwrap(), "beta");
        assert!(ordered.is_empty());
    }

    #[test]
    fn bare_json_objects_accepted() {
        let (entries, _) = parse_jsonl_entries("{\"1\": \"a\"}\n{\"2\": \"b\"}");
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn id_and_text_key_heuristics() {
        let (entries, _) =
            parse_jsonl_entries(r#"{"line": 3, "translation": "hello there"}"#);
        assert_eq!(entries.get("3").unwrap(), "hello there");
    }

    #[test]
    fn single_text_key_goes_to_ordered() {
        let (entries, ordered) = parse_jsonl_entries("{\"text\": \"solo\"}");
        assert!(entries.is_empty());
        assert_eq!(ordered, vec!["solo"]);
    }

    #[test]
    fn code_fences_are_stripped() {
        let reply = "```jsonl\njsonline{\"1\": \"inside\"}\n```";
        let (entries, _) = parse_jsonl_entries(reply);
        assert_eq!(entries.get("1").unwrap(), "inside");
    }

    #[test]
    fn array_reply_fills_ordered() {
        let (entries, ordered) = parse_jsonl_entries(r#"["one", "two"]"#);
        assert!(entries.is_empty());
        assert_eq!(ordered, vec!["one", "two"]);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let (entries, ordered) =
            parse_jsonl_entries("noise\njsonline{\"1\": \"kept\"}\nmore noise");
        assert_eq!(entries.len(), 1);
        assert!(ordered.is_empty());
        assert_eq!(entries.get("1").unwrap(), "kept");
    }

    #[test]
    fn trailing_prose_around_object_recovered() {
        let (entries, _) =
            parse_jsonl_entries("Here is the result: {\"1\": \"recovered\"} hope it helps");
        assert_eq!(entries.get("1").unwrap(), "recovered");
    }

    #[test]
    fn null_values_become_empty() {
        let (entries, _) = parse_jsonl_entries("{\"1\": null}");
        assert_eq!(entries.get("1").unwrap(), "");
    }

    #[test]
    fn first_json_block_respects_string_literals() {
        let text = r#"prefix {"a": "has } brace"} suffix"#;
        let block = extract_first_json_block(text).unwrap();
        assert_eq!(block, r#"{"a": "has } brace"}"#);
    }

    #[test]
    fn tagged_entries_default_pattern() {
        let entries = parse_tagged_entries("@@1@@first\n@@2@@second", None);
        assert_eq!(entries.get("1").unwrap(), "first");
        assert_eq!(entries.get("2").unwrap(), "second");
    }

    #[test]
    fn extract_line_prefers_jsonl_map() {
        let reply = "jsonline{\"5\": \"map hit\"}";
        assert_eq!(extract_line_for_policy(reply, 4, None).unwrap(), "map hit");
    }

    #[test]
    fn extract_line_zero_based_fallback_key() {
        let reply = "jsonline{\"4\": \"zero based\"}";
        assert_eq!(
            extract_line_for_policy(reply, 4, None).unwrap(),
            "zero based"
        );
    }

    #[test]
    fn extract_line_single_ordered_matches_any_index() {
        let reply = "{\"text\": \"the only line\"}";
        assert_eq!(
            extract_line_for_policy(reply, 9, None).unwrap(),
            "the only line"
        );
    }

    #[test]
    fn extract_line_falls_back_to_tagged() {
        let reply = "@@3@@tagged line";
        assert_eq!(
            extract_line_for_policy(reply, 2, None).unwrap(),
            "tagged line"
        );
    }

    #[test]
    fn extract_line_none_when_nothing_matches() {
        assert!(extract_line_for_policy("plain prose", 0, None).is_none());
    }
}
