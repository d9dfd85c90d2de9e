// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Reversible placeholder protection.
//!
//! Before a block is sent to the model, substrings matching the protect
//! patterns are swapped for opaque `@P<n>@` placeholders; after the reply is
//! post-processed the placeholders are swapped back.  Instances are
//! per-block: the placeholder map must never be shared across workers.

use regex::Regex;
use tracing::warn;

use crate::rules::Rule;

/// Default protection set: template variables, printf-style placeholders,
/// markup tags, and bracketed tokens.
pub const DEFAULT_PROTECT_PATTERNS: &[&str] = &[
    r"\{[A-Za-z_][A-Za-z0-9_]*\}",
    r"%(?:\d+\$)?[sdif]",
    r"<[^<>\n]+>",
    r"\[[A-Za-z0-9_]+\]",
];

/// Subtitle set: restricted to legal tags so normal bracket punctuation in
/// dialogue is not clipped.
pub const SUBTITLE_PROTECT_PATTERNS: &[&str] = &[
    r"\{\\[^{}]*\}",
    r"</?(?:i|b|u|s|font|ruby|rt|c)[^<>\n]*>",
    r"\\[Nnh]",
];

pub struct Protector {
    patterns: Vec<Regex>,
    /// `placeholder → original`, in injection order.
    replacements: Vec<(String, String)>,
    counter: usize,
}

impl Protector {
    /// Compile the pattern list; invalid patterns are skipped with a warning.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let compiled = patterns
            .iter()
            .filter_map(|p| match Regex::new(p.as_ref()) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!(pattern = p.as_ref(), error = %e, "protect pattern skipped");
                    None
                }
            })
            .collect();
        Self {
            patterns: compiled,
            replacements: Vec::new(),
            counter: 0,
        }
    }

    /// Replace matches with stable placeholders, scanning patterns in order.
    pub fn protect(&mut self, text: &str) -> String {
        let mut current = text.to_string();
        // Detached handles: the loop body mutates the replacement map.
        let patterns: Vec<Regex> = self.patterns.clone();
        for pattern in &patterns {
            let mut next = String::with_capacity(current.len());
            let mut last_end = 0;
            for m in pattern.find_iter(&current) {
                next.push_str(&current[last_end..m.start()]);
                self.counter += 1;
                let placeholder = format!("@P{}@", self.counter);
                self.replacements
                    .push((placeholder.clone(), m.as_str().to_string()));
                next.push_str(&placeholder);
                last_end = m.end();
            }
            next.push_str(&current[last_end..]);
            current = next;
        }
        current
    }

    /// Reverse the mapping in injection order.
    pub fn restore(&self, text: &str) -> String {
        let mut current = text.to_string();
        for (placeholder, original) in &self.replacements {
            current = current.replace(placeholder.as_str(), original);
        }
        current
    }

    pub fn replacement_count(&self) -> usize {
        self.replacements.len()
    }
}

// ── Pattern list assembly ─────────────────────────────────────────────────────

/// Pattern list entries: `!pat` subtracts, `+pat` or a bare pattern adds,
/// `#`/`//` lines are comments.
fn parse_pattern_lines(lines: &[String]) -> (Vec<String>, Vec<String>) {
    let mut additions = Vec::new();
    let mut removals = Vec::new();
    for raw in lines {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
            continue;
        }
        if let Some(pat) = line.strip_prefix('!') {
            let pat = pat.trim();
            if !pat.is_empty() {
                removals.push(pat.to_string());
            }
            continue;
        }
        let pat = line.strip_prefix('+').unwrap_or(line).trim();
        if !pat.is_empty() {
            additions.push(pat.to_string());
        }
    }
    (additions, removals)
}

/// A patterns payload may be a list, a JSON-encoded list, or newline text.
fn parse_pattern_payload(raw: &serde_json::Value) -> Vec<String> {
    match raw {
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        serde_json::Value::String(s) => {
            let stripped = s.trim();
            if stripped.is_empty() {
                return Vec::new();
            }
            if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(stripped) {
                return items
                    .iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect();
            }
            stripped
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect()
        }
        _ => Vec::new(),
    }
}

fn collect_protect_rule_lines(rules: &[Rule]) -> (bool, Vec<String>) {
    let mut enabled = false;
    let mut lines = Vec::new();
    for rule in rules {
        if !rule.active {
            continue;
        }
        if rule.rule_type == "protect" || rule.pattern == "text_protect" {
            enabled = true;
            if let Some(raw) = rule.options.as_ref().and_then(|o| o.get("patterns")) {
                lines.extend(parse_pattern_payload(raw));
            }
        }
    }
    (enabled, lines)
}

/// Legacy carrier: `restore_protection` post rules may carry extra patterns
/// under `options.customPattern`.
fn collect_legacy_protect_lines(post_rules: &[Rule]) -> Vec<String> {
    let mut lines = Vec::new();
    for rule in post_rules {
        if !rule.active || rule.pattern != "restore_protection" {
            continue;
        }
        if let Some(raw) = rule.options.as_ref().and_then(|o| o.get("customPattern")) {
            lines.extend(parse_pattern_payload(raw));
        }
    }
    lines
}

/// Merge the default set with rule-supplied additions and removals.  Returns
/// an empty list (protection off) unless protection is enabled.
pub fn build_protect_patterns(
    pre_rules: &[Rule],
    post_rules: &[Rule],
    enable: bool,
    base: &[&str],
) -> Vec<String> {
    if !enable {
        return Vec::new();
    }
    let (_, protect_lines) = collect_protect_rule_lines(pre_rules);
    let legacy_lines = collect_legacy_protect_lines(post_rules);

    let mut all_lines = protect_lines;
    all_lines.extend(legacy_lines);
    let (additions, removals) = parse_pattern_lines(&all_lines);

    let mut merged: Vec<String> = base.iter().map(|p| p.to_string()).collect();
    for pat in additions {
        if !merged.contains(&pat) {
            merged.push(pat);
        }
    }
    merged.retain(|pat| !removals.contains(pat));
    merged
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
