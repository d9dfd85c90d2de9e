// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Rule engine: replace / regex / format / script transformations.
//!
//! Rules run in order; a failing rule never aborts the chain.  In
//! `strict_line_count` mode any rule whose output would change the line count
//! is skipped with a warning, and the format rules that exist to change line
//! density are skipped outright.

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use hibiki_profile::ProfileStore;

use crate::protect::Protector;
use crate::script::ScriptRule;

fn default_true() -> bool {
    true
}

/// One processing rule as authored in YAML/JSON.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Rule {
    #[serde(rename = "type", default)]
    pub rule_type: String,
    /// Literal needle, regex pattern, or format name depending on `type`.
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub replacement: String,
    /// Script body (`script` rules; `pattern` is the legacy carrier).
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub options: Option<serde_json::Value>,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Resolve a rule spec into a flat rule list.  Accepted shapes: an inline
/// list of rules, a `rule` profile id, a JSON rule file path, or a list
/// mixing rules with references.
pub fn resolve_rules(spec: Option<&serde_yaml::Value>, store: Option<&ProfileStore>) -> Vec<Rule> {
    let Some(spec) = spec else {
        return Vec::new();
    };
    match spec {
        serde_yaml::Value::Null => Vec::new(),
        serde_yaml::Value::String(reference) => resolve_rule_reference(reference, store),
        serde_yaml::Value::Sequence(items) => {
            let mut rules = Vec::new();
            for item in items {
                match item {
                    serde_yaml::Value::Mapping(_) => {
                        if let Ok(rule) = serde_yaml::from_value::<Rule>(item.clone()) {
                            rules.push(rule);
                        }
                    }
                    serde_yaml::Value::String(reference) => {
                        rules.extend(resolve_rule_reference(reference, store));
                    }
                    _ => {}
                }
            }
            rules
        }
        _ => Vec::new(),
    }
}

fn resolve_rule_reference(reference: &str, store: Option<&ProfileStore>) -> Vec<Rule> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Vec::new();
    }
    if let Some(store) = store {
        if let Ok(mapping) = store.load_value("rule", reference) {
            if let Some(serde_yaml::Value::Sequence(_)) =
                mapping.get("rules")
            {
                let rules = mapping.get("rules").unwrap();
                return resolve_rules(Some(rules), None);
            }
            return Vec::new();
        }
    }
    // Not a profile: try a JSON rule file.
    let path = std::path::Path::new(reference);
    if path.exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(rules) = serde_json::from_str::<Vec<Rule>>(&content) {
                return rules;
            }
        }
    }
    Vec::new()
}

/// Compile-check a regex and flag patterns prone to catastrophic
/// backtracking.  The heuristics only warn; the pattern is still used.
pub fn validate_regex(pattern: &str) -> Result<(), String> {
    if pattern.is_empty() {
        return Err("Empty pattern".to_string());
    }
    Regex::new(pattern).map_err(|e| format!("Invalid regex syntax: {e}"))?;

    let dangerous = [
        (r"(\.\*){2,}", "Multiple .* in sequence"),
        (r"(\.\+){2,}", "Multiple .+ in sequence"),
        (r"\(\.\*\)\+", "Nested quantifiers with .*"),
        (r"\(\.\+\)\+", "Nested quantifiers with .+"),
    ];
    for (indicator, message) in dangerous {
        if Regex::new(indicator).unwrap().is_match(pattern) {
            warn!(pattern, "{message}");
        }
    }
    Ok(())
}

enum CompiledRule {
    Replace {
        pattern: String,
        replacement: String,
    },
    Regex {
        regex: Option<Regex>,
        replacement: String,
    },
    Format {
        name: String,
        options: serde_json::Value,
    },
    Script(ScriptRule),
    /// `protect` rules configure the protector; no text mutation here.
    Config,
}

pub struct RuleProcessor {
    rules: Vec<CompiledRule>,
}

impl RuleProcessor {
    pub fn new(rules: Vec<Rule>) -> Self {
        let compiled = rules
            .into_iter()
            .filter(|rule| rule.active)
            .map(|rule| match rule.rule_type.as_str() {
                "replace" => CompiledRule::Replace {
                    pattern: rule.pattern,
                    replacement: rule.replacement,
                },
                "regex" => {
                    let regex = if rule.pattern.is_empty() {
                        None
                    } else {
                        match validate_regex(&rule.pattern) {
                            Ok(()) => Regex::new(&rule.pattern).ok(),
                            Err(error) => {
                                warn!(pattern = %rule.pattern, error = %error, "regex rule disabled");
                                None
                            }
                        }
                    };
                    CompiledRule::Regex {
                        regex,
                        replacement: rule.replacement,
                    }
                }
                "protect" => CompiledRule::Config,
                "format" => CompiledRule::Format {
                    name: rule.pattern,
                    options: rule.options.unwrap_or(serde_json::Value::Null),
                },
                "python" | "script" => {
                    let source = rule.script.unwrap_or(rule.pattern);
                    CompiledRule::Script(ScriptRule::new(source))
                }
                other => {
                    debug!(rule_type = other, "unknown rule type ignored");
                    CompiledRule::Config
                }
            })
            .collect();
        Self { rules: compiled }
    }

    /// Apply all active rules in order.
    pub fn process(
        &self,
        text: &str,
        src_text: Option<&str>,
        protector: Option<&Protector>,
        strict_line_count: bool,
    ) -> String {
        if text.is_empty() {
            return text.to_string();
        }
        let original_line_count = text.lines().count();
        let mut current = text.to_string();

        for rule in &self.rules {
            match rule {
                CompiledRule::Replace {
                    pattern,
                    replacement,
                } => {
                    if pattern.is_empty() {
                        continue;
                    }
                    let next = current.replace(pattern.as_str(), replacement);
                    current = guard_line_count(current, next, original_line_count, strict_line_count, "replace");
                }
                CompiledRule::Regex { regex, replacement } => {
                    let Some(regex) = regex else { continue };
                    let next = regex.replace_all(&current, replacement.as_str()).into_owned();
                    current = guard_line_count(current, next, original_line_count, strict_line_count, "regex");
                }
                CompiledRule::Format { name, options } => {
                    current = apply_format(
                        name,
                        &current,
                        src_text,
                        options,
                        protector,
                        strict_line_count,
                    );
                }
                CompiledRule::Script(script) => {
                    let next = script.apply(&current, src_text);
                    current = guard_line_count(current, next, original_line_count, strict_line_count, "script");
                }
                CompiledRule::Config => {}
            }
        }
        current
    }
}

fn guard_line_count(
    current: String,
    next: String,
    original_line_count: usize,
    strict: bool,
    rule_kind: &str,
) -> String {
    if strict && next.lines().count() != original_line_count {
        warn!(rule_kind, "rule skipped: output changes line count in strict mode");
        current
    } else {
        next
    }
}

// ── Format transformers ───────────────────────────────────────────────────────

fn apply_format(
    name: &str,
    text: &str,
    src_text: Option<&str>,
    options: &serde_json::Value,
    protector: Option<&Protector>,
    strict_line_count: bool,
) -> String {
    // Formats that exist to change line density are skipped in strict mode.
    if strict_line_count
        && matches!(
            name,
            "clean_empty" | "clean_empty_lines" | "ensure_single_newline" | "ensure_double_newline"
                | "merge_short_lines"
        )
    {
        warn!(format = name, "format skipped in strict line-count mode");
        return text.to_string();
    }

    match name {
        "restore_protection" => match protector {
            Some(protector) => protector.restore(text),
            None => text.to_string(),
        },
        "clean_empty" | "clean_empty_lines" => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        "smart_quotes" => smart_quotes(text),
        "ellipsis" => {
            let text = Regex::new(r"\.{3,}").unwrap().replace_all(text, "……");
            Regex::new(r"。{3,}")
                .unwrap()
                .replace_all(&text, "……")
                .into_owned()
        }
        "full_to_half_punct" => {
            let table = [
                ('，', ','),
                ('。', '.'),
                ('！', '!'),
                ('？', '?'),
                ('：', ':'),
                ('；', ';'),
                ('（', '('),
                ('）', ')'),
            ];
            let mut out = text.to_string();
            for (full, half) in table {
                out = out.replace(full, &half.to_string());
            }
            out
        }
        "ensure_single_newline" => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n"),
        "ensure_double_newline" => text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| l.trim_end())
            .collect::<Vec<_>>()
            .join("\n\n"),
        "merge_short_lines" => merge_short_lines(text),
        "ruby_cleaner" => {
            let aggressive = options
                .get("aggressive")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            ruby_clean(text, aggressive)
        }
        "ruby_cleaner_aggressive" => ruby_clean(text, true),
        "punctuation_fixer" => match src_text {
            Some(src) => punctuation_fix(src, text),
            None => text.to_string(),
        },
        "kana_fixer" => kana_fix(text),
        "number_fixer" => match src_text {
            Some(src) => number_fix(src, text),
            None => text.to_string(),
        },
        "traditional_chinese" => {
            // No conversion collaborator in-core: identity.
            static LOGGED: std::sync::Once = std::sync::Once::new();
            LOGGED.call_once(|| {
                debug!("traditional_chinese format has no conversion backend; passing through")
            });
            text.to_string()
        }
        _ => text.to_string(),
    }
}

/// Convert quotes to corner quotes.  Directional quotes map directly;
/// straight quotes are only paired within a line when their count is even.
fn smart_quotes(text: &str) -> String {
    let text = text
        .replace('“', "「")
        .replace('”', "」")
        .replace('‘', "『")
        .replace('’', "』");

    let double = Regex::new("\"([^\"]*)\"").unwrap();
    let single = Regex::new("'([^']*)'").unwrap();
    text.lines()
        .map(|line| {
            let mut line = line.to_string();
            let dq = line.matches('"').count();
            if dq > 0 && dq % 2 == 0 {
                line = double.replace_all(&line, "「$1」").into_owned();
            }
            let sq = line.matches('\'').count();
            if sq > 0 && sq % 2 == 0 {
                line = single.replace_all(&line, "『$1』").into_owned();
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn merge_short_lines(text: &str) -> String {
    let sentence_end = Regex::new(r#"[。！？!?.…」』”"']\s*$"#).unwrap();
    let mut merged: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let stripped = line.trim();
        if stripped.is_empty() {
            if !current.is_empty() {
                merged.push(std::mem::take(&mut current));
            }
            merged.push(String::new());
            continue;
        }
        if current.is_empty() {
            current = line.to_string();
            continue;
        }
        let is_short = current.trim().chars().count() < 15;
        let ends_with_punct = sentence_end.is_match(current.trim_end());
        if is_short && !ends_with_punct {
            current.push_str(stripped);
        } else {
            merged.push(std::mem::take(&mut current));
            current = line.to_string();
        }
    }
    if !current.is_empty() {
        merged.push(current);
    }
    merged.join("\n")
}

/// Strip ruby reading annotations: `漢字(かんじ)`, `漢字（かんじ）`, and
/// `|漢字《かんじ》`.  Aggressive mode also removes any parenthesised
/// kana-only run regardless of what precedes it.
fn ruby_clean(text: &str, aggressive: bool) -> String {
    let kanji_reading =
        Regex::new(r"([\u{3400}-\u{4DBF}\u{4E00}-\u{9FFF}]+)[(（][\u{3040}-\u{30FF}ー]+[)）]")
            .unwrap();
    let corner_reading = Regex::new(r"[|｜]?([^《》|｜\n]+)《[^《》]*》").unwrap();
    let mut out = kanji_reading.replace_all(text, "$1").into_owned();
    out = corner_reading.replace_all(&out, "$1").into_owned();
    if aggressive {
        let bare_reading = Regex::new(r"[(（][\u{3040}-\u{30FF}ー]+[)）]").unwrap();
        out = bare_reading.replace_all(&out, "").into_owned();
    }
    out
}

/// Mirror the source's terminal punctuation when the translation dropped it.
fn punctuation_fix(src: &str, text: &str) -> String {
    const TERMINALS: &[char] = &['。', '！', '？', '…'];
    let src_end = src.trim_end().chars().last();
    let dst_end = text.trim_end().chars().last();
    let (Some(src_end), Some(dst_end)) = (src_end, dst_end) else {
        return text.to_string();
    };
    if TERMINALS.contains(&src_end) && !TERMINALS.contains(&dst_end) && !dst_end.is_ascii_punctuation()
    {
        let mut out = text.trim_end().to_string();
        out.push(src_end);
        return out;
    }
    text.to_string()
}

/// Normalise half-width kana punctuation to full-width.
fn kana_fix(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            'ｰ' => 'ー',
            '｡' => '。',
            '｢' => '「',
            '｣' => '」',
            '､' => '、',
            '･' => '・',
            other => other,
        })
        .collect()
}

/// Convert full-width digits back to ASCII when the source used ASCII digits.
fn number_fix(src: &str, text: &str) -> String {
    if !src.chars().any(|c| c.is_ascii_digit()) {
        return text.to_string();
    }
    text.chars()
        .map(|c| match c {
            '０'..='９' => char::from_u32(c as u32 - '０' as u32 + '0' as u32).unwrap(),
            other => other,
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
