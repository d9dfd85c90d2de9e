// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Glossary loading.
//!
//! A glossary spec may be an inline map, a list of `{src, dst}` entries
//! (with `jp`/`original` and `zh`/`translation` accepted as aliases), a JSON
//! file path, or an inline JSON string.  For prompts the glossary renders as
//! one `key: value` pair per line.

use std::collections::BTreeMap;

fn entry_from_object(entry: &serde_json::Value) -> Option<(String, String)> {
    let object = entry.as_object()?;
    let pick = |keys: &[&str]| {
        keys.iter()
            .find_map(|k| object.get(*k))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty())
    };
    let src = pick(&["src", "jp", "original", "source"])?;
    let dst = pick(&["dst", "zh", "translation", "target"])?;
    Some((src, dst))
}

fn from_json(value: &serde_json::Value) -> BTreeMap<String, String> {
    let mut glossary = BTreeMap::new();
    match value {
        serde_json::Value::Object(map) => {
            for (k, v) in map {
                if let Some(v) = v.as_str() {
                    if !k.is_empty() && !v.is_empty() {
                        glossary.insert(k.clone(), v.to_string());
                    }
                }
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                if let Some((src, dst)) = entry_from_object(item) {
                    glossary.insert(src, dst);
                }
            }
        }
        _ => {}
    }
    glossary
}

/// Load a glossary spec into a term map.  Unloadable specs yield an empty
/// map rather than an error: a broken glossary should not kill a run.
pub fn load_glossary(spec: Option<&serde_yaml::Value>) -> BTreeMap<String, String> {
    let Some(spec) = spec else {
        return BTreeMap::new();
    };
    match spec {
        serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_) => {
            match serde_json::to_value(spec) {
                Ok(json) => from_json(&json),
                Err(_) => BTreeMap::new(),
            }
        }
        serde_yaml::Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return BTreeMap::new();
            }
            let path = std::path::Path::new(raw);
            if path.exists() {
                let Ok(content) = std::fs::read_to_string(path) else {
                    return BTreeMap::new();
                };
                // Tolerate a UTF-8 BOM from Windows editors.
                let content = content.trim_start_matches('\u{feff}');
                return serde_json::from_str(content)
                    .map(|v| from_json(&v))
                    .unwrap_or_default();
            }
            serde_json::from_str(raw).map(|v| from_json(&v)).unwrap_or_default()
        }
        _ => BTreeMap::new(),
    }
}

/// Render a glossary for prompt injection: `key: value` per line.
pub fn render_glossary(glossary: &BTreeMap<String, String>) -> String {
    glossary
        .iter()
        .map(|(k, v)| format!("{k}: {v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Glossary text for the `{{glossary}}` prompt token.  Structured specs are
/// rendered; a file that is not JSON is used verbatim (free-form glossary
/// text is a supported prompt style); an unparseable inline string is passed
/// through as-is.
pub fn load_glossary_text(spec: Option<&serde_yaml::Value>) -> String {
    let Some(spec) = spec else {
        return String::new();
    };
    match spec {
        serde_yaml::Value::Mapping(_) | serde_yaml::Value::Sequence(_) => {
            render_glossary(&load_glossary(Some(spec)))
        }
        serde_yaml::Value::String(raw) => {
            let raw = raw.trim();
            if raw.is_empty() {
                return String::new();
            }
            let path = std::path::Path::new(raw);
            if path.exists() {
                let Ok(content) = std::fs::read_to_string(path) else {
                    return String::new();
                };
                let content = content.trim_start_matches('\u{feff}');
                return match serde_json::from_str::<serde_json::Value>(content) {
                    Ok(json) => render_glossary(&from_json(&json)),
                    Err(_) => content.trim().to_string(),
                };
            }
            match serde_json::from_str::<serde_json::Value>(raw) {
                Ok(json) => render_glossary(&from_json(&json)),
                Err(_) => raw.to_string(),
            }
        }
        _ => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
