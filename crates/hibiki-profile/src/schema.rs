// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Typed records for the six profile kinds.
//!
//! Profiles are authored by hand, so the schemas are forgiving: every field
//! beyond `id` has a default, common aliases are accepted, and numeric
//! settings tolerate being written as strings (`temperature: "0.7"`).  The
//! lenient scalar helpers mirror that tolerance for fields kept as raw YAML.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

/// Parse a YAML scalar as f64, accepting numbers and numeric strings.
pub fn lenient_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a YAML scalar as u64, accepting numbers and numeric strings.
pub fn lenient_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse a YAML scalar as i64, accepting numbers and numeric strings.
pub fn lenient_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_joiner() -> String {
    "\n".to_string()
}

// ── api ───────────────────────────────────────────────────────────────────────

/// `api` kind profile: one OpenAI-compatible endpoint, or a weighted pool of
/// them (`type: pool`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `openai_compat` (default) or `pool`.
    #[serde(rename = "type", default)]
    pub api_type: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Single key, newline-separated keys, or a list.  More than one key
    /// enables round-robin rotation.
    #[serde(default)]
    pub api_key: Option<Value>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
    /// Extra key/value pairs merged verbatim into the request body.
    #[serde(default)]
    pub params: Option<serde_yaml::Mapping>,
    /// Requests per minute; ≤ 0 disables the limiter.
    #[serde(default, alias = "requests_per_minute")]
    pub rpm: Option<Value>,
    /// Connect+read timeout in seconds.
    #[serde(default)]
    pub timeout: Option<Value>,
    /// Fallbacks used when the pipeline settings leave these unset.
    #[serde(default)]
    pub max_retries: Option<Value>,
    #[serde(default)]
    pub concurrency: Option<Value>,
    /// Pool endpoints (`type: pool` only).
    #[serde(default)]
    pub endpoints: Vec<EndpointProfile>,
}

impl ApiProfile {
    pub fn api_type(&self) -> &str {
        self.api_type.as_deref().unwrap_or("openai_compat")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointProfile {
    #[serde(default, alias = "baseUrl")]
    pub base_url: String,
    #[serde(default, alias = "apiKey")]
    pub api_key: Option<Value>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub weight: Option<Value>,
    #[serde(default)]
    pub rpm: Option<Value>,
    #[serde(default, alias = "endpoint_id")]
    pub id: Option<String>,
    #[serde(default, alias = "name")]
    pub label: Option<String>,
}

// ── prompt ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PromptProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub persona: Option<String>,
    #[serde(default)]
    pub style_rules: Option<String>,
    #[serde(default)]
    pub output_rules: Option<String>,
    #[serde(default)]
    pub system_template: Option<String>,
    #[serde(default)]
    pub user_template: Option<String>,
    #[serde(default)]
    pub context: ContextConfig,
}

/// Surrounding-line context configuration for prompt assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default)]
    pub before_lines: usize,
    #[serde(default)]
    pub after_lines: usize,
    #[serde(default = "default_joiner")]
    pub joiner: String,
    /// `jsonl` switches line-chunk runs to the per-line JSONL contract.
    #[serde(default)]
    pub source_format: Option<String>,
    /// Lines per JSONL source window (line chunk mode; minimum 1).
    #[serde(default)]
    pub source_lines: Option<usize>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            before_lines: 0,
            after_lines: 0,
            joiner: default_joiner(),
            source_format: None,
            source_lines: None,
        }
    }
}

impl ContextConfig {
    pub fn is_jsonl(&self) -> bool {
        self.source_format
            .as_deref()
            .map(|f| f.trim().eq_ignore_ascii_case("jsonl"))
            .unwrap_or(false)
    }
}

// ── parser ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(rename = "type", default)]
    pub parser_type: String,
    #[serde(default)]
    pub options: ParserOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParserOptions {
    /// line_strict: `join` (default) | `first` | `error`.
    #[serde(default)]
    pub multi_line: Option<String>,
    /// tagged_line / regex pattern.
    #[serde(default)]
    pub pattern: Option<String>,
    /// regex capture group: index or name.  Default group 0.
    #[serde(default)]
    pub group: Option<Value>,
    /// json_object dotted path (`key` accepted as an alias).
    #[serde(default, alias = "key")]
    pub path: Option<String>,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default)]
    pub dotall: bool,
    #[serde(default)]
    pub ignorecase: bool,
    /// Alternative to the booleans: `flags: [multiline, dotall]` or a
    /// comma-separated string.
    #[serde(default)]
    pub flags: Option<Value>,
}

// ── policy ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `strict` | `tolerant`.
    #[serde(rename = "type", default)]
    pub policy_type: String,
    #[serde(default)]
    pub options: PolicyOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyOptions {
    /// strict only: `retry` | `error` (default) | `pad` | `truncate` | `align`.
    #[serde(default)]
    pub on_mismatch: Option<String>,
    /// Trim lines before running checks (default true).
    #[serde(default)]
    pub trim: Option<bool>,
    #[serde(default, alias = "similarity")]
    pub similarity_threshold: Option<f64>,
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub checks: Option<PolicyChecks>,
}

/// Check selection, accepted as a map of flags, a list of names, or one name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PolicyChecks {
    Map(BTreeMap<String, bool>),
    List(Vec<String>),
    One(String),
}

impl PolicyChecks {
    /// Normalise to the set of enabled check names.
    pub fn enabled(&self) -> Vec<String> {
        match self {
            PolicyChecks::Map(map) => map
                .iter()
                .filter(|(_, on)| **on)
                .map(|(k, _)| k.clone())
                .collect(),
            PolicyChecks::List(names) => names.clone(),
            PolicyChecks::One(name) => vec![name.clone()],
        }
    }
}

// ── chunk ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// `block` | `line` (`legacy` normalises to `block` on load).
    #[serde(default, alias = "type")]
    pub chunk_type: String,
    #[serde(default)]
    pub options: ChunkOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkOptions {
    #[serde(default)]
    pub target_chars: Option<usize>,
    #[serde(default)]
    pub max_chars: Option<usize>,
    #[serde(default)]
    pub enable_balance: Option<bool>,
    #[serde(default)]
    pub balance_threshold: Option<f64>,
    #[serde(default)]
    pub balance_count: Option<usize>,
    #[serde(default)]
    pub strict: Option<bool>,
    #[serde(default)]
    pub keep_empty: Option<bool>,
}

// ── pipeline ──────────────────────────────────────────────────────────────────

/// The compile target of the runner: six profile references plus run settings
/// and an optional processing block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineProfile {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub parser: String,
    #[serde(default)]
    pub chunk_policy: String,
    #[serde(default)]
    pub line_policy: Option<String>,
    /// `false` disables the line policy even when one is named.
    #[serde(default)]
    pub apply_line_policy: Option<bool>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub processing: Option<ProcessingConfig>,
    /// Legacy top-level fields honoured when the processing block leaves them
    /// unset.
    #[serde(default)]
    pub glossary: Option<Value>,
    #[serde(default)]
    pub rules_pre: Option<Value>,
    #[serde(default)]
    pub rules_post: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<Value>,
    #[serde(default)]
    pub max_tokens: Option<Value>,
    #[serde(default)]
    pub concurrency: Option<Value>,
    #[serde(default)]
    pub max_retries: Option<Value>,
    #[serde(default)]
    pub timeout: Option<Value>,
    #[serde(default, alias = "extra")]
    pub params: Option<serde_yaml::Mapping>,
    #[serde(default)]
    pub headers: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Inline rule list, rule-profile id, or JSON rule file path.
    #[serde(default)]
    pub rules_pre: Option<Value>,
    #[serde(default)]
    pub rules_post: Option<Value>,
    /// Inline map/list, JSON file path, or inline JSON string.
    #[serde(default)]
    pub glossary: Option<Value>,
    #[serde(default)]
    pub source_lang: Option<String>,
    #[serde(default)]
    pub enable_quality: Option<bool>,
    #[serde(default)]
    pub text_protect: Option<bool>,
    #[serde(default)]
    pub strict_line_count: Option<bool>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
