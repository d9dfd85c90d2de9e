// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Response parsers.
//!
//! Every parser shares one contract: `parse(text) -> ParseOutput { text,
//! lines }`, failing with [`ParserError`] on structural mismatch so the retry
//! loop can distinguish a malformed reply from a provider failure.  The
//! parser set is a closed enum; profiles select a strategy by name.
//!
//! The JSONL helpers in [`lineformat`] are *not* registered parsers: the
//! runner owns JSONL extraction because it must correlate per-line output
//! with the specific line ids present in each block.

pub mod lineformat;

use regex::RegexBuilder;
use thiserror::Error;

use hibiki_profile::ParserProfile;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ParserError(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseOutput {
    pub text: String,
    pub lines: Vec<String>,
}

impl ParseOutput {
    fn from_text(text: String) -> Self {
        let lines = split_lines_keep_empty(&text);
        Self { text, lines }
    }
}

/// Split preserving interior empties; the empty string is one empty line.
fn split_lines_keep_empty(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

/// Coerce a JSON value to text the way replies use them: strings verbatim,
/// null empty, everything else in JSON form.
fn json_value_to_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// How `line_strict` collapses a multi-line reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiLine {
    Join,
    First,
    Error,
}

/// Regex capture selector: index or name.
#[derive(Debug, Clone)]
pub enum GroupRef {
    Index(usize),
    Name(String),
}

#[derive(Debug)]
pub enum Parser {
    Plain,
    LineStrict { multi_line: MultiLine },
    JsonArray,
    JsonObject { path: String },
    TaggedLine { pattern: regex::Regex },
    Regex { pattern: regex::Regex, group: GroupRef },
}

impl Parser {
    pub fn from_profile(profile: &ParserProfile) -> Result<Self, ParserError> {
        let options = &profile.options;
        match profile.parser_type.trim() {
            "plain" => Ok(Parser::Plain),
            "line_strict" => {
                let multi_line = match options.multi_line.as_deref().unwrap_or("join") {
                    "first" => MultiLine::First,
                    "error" => MultiLine::Error,
                    _ => MultiLine::Join,
                };
                Ok(Parser::LineStrict { multi_line })
            }
            "json_array" => Ok(Parser::JsonArray),
            "json_object" => {
                let path = options
                    .path
                    .clone()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        ParserError("JsonObjectParser: options.path or options.key is required".into())
                    })?;
                Ok(Parser::JsonObject { path })
            }
            "tagged_line" => {
                let raw = options
                    .pattern
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or(lineformat::DEFAULT_TAGGED_PATTERN);
                let pattern = regex::Regex::new(raw).map_err(|e| {
                    ParserError(format!("TaggedLineParser: invalid pattern: {e}"))
                })?;
                Ok(Parser::TaggedLine { pattern })
            }
            "regex" => {
                let raw = options
                    .pattern
                    .as_deref()
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .ok_or_else(|| ParserError("RegexParser: options.pattern is required".into()))?;

                let mut multiline = options.multiline;
                let mut dotall = options.dotall;
                let mut ignorecase = options.ignorecase;
                for flag in flag_names(options.flags.as_ref()) {
                    match flag.to_ascii_lowercase().as_str() {
                        "multiline" => multiline = true,
                        "dotall" => dotall = true,
                        "ignorecase" => ignorecase = true,
                        _ => {}
                    }
                }
                let pattern = RegexBuilder::new(raw)
                    .multi_line(multiline)
                    .dot_matches_new_line(dotall)
                    .case_insensitive(ignorecase)
                    .build()
                    .map_err(|e| ParserError(format!("RegexParser: invalid pattern: {e}")))?;

                let group = match options.group.as_ref() {
                    None => GroupRef::Index(0),
                    Some(value) => match hibiki_profile::lenient_u64(value) {
                        Some(idx) => GroupRef::Index(idx as usize),
                        None => GroupRef::Name(
                            value.as_str().map(str::to_string).unwrap_or_default(),
                        ),
                    },
                };
                Ok(Parser::Regex { pattern, group })
            }
            other => Err(ParserError(format!("unknown parser type: {other}"))),
        }
    }

    pub fn parse(&self, text: &str) -> Result<ParseOutput, ParserError> {
        match self {
            Parser::Plain => Ok(ParseOutput::from_text(
                text.trim_matches('\n').to_string(),
            )),
            Parser::LineStrict { multi_line } => {
                let lines = split_lines_keep_empty(text.trim_matches('\n'));
                if lines.len() <= 1 {
                    let line = lines.first().cloned().unwrap_or_default();
                    return Ok(ParseOutput {
                        text: line.clone(),
                        lines: vec![line],
                    });
                }
                match multi_line {
                    MultiLine::First => {
                        let first = lines[0].clone();
                        Ok(ParseOutput {
                            text: first.clone(),
                            lines: vec![first],
                        })
                    }
                    MultiLine::Error => {
                        Err(ParserError("LineStrictParser: multiple lines detected".into()))
                    }
                    MultiLine::Join => {
                        let joined = lines
                            .iter()
                            .filter(|l| !l.trim().is_empty())
                            .cloned()
                            .collect::<Vec<_>>()
                            .join(" ");
                        Ok(ParseOutput {
                            text: joined.clone(),
                            lines: vec![joined],
                        })
                    }
                }
            }
            Parser::JsonArray => {
                let data: serde_json::Value = serde_json::from_str(text)
                    .map_err(|_| ParserError("JsonArrayParser: invalid JSON".into()))?;
                let array = data
                    .as_array()
                    .ok_or_else(|| ParserError("JsonArrayParser: expected JSON array".into()))?;
                let lines: Vec<String> = array.iter().map(json_value_to_text).collect();
                Ok(ParseOutput {
                    text: lines.join("\n"),
                    lines,
                })
            }
            Parser::JsonObject { path } => {
                let data: serde_json::Value = serde_json::from_str(text)
                    .map_err(|_| ParserError("JsonObjectParser: invalid JSON".into()))?;
                if !data.is_object() {
                    return Err(ParserError("JsonObjectParser: expected JSON object".into()));
                }
                let value = get_by_path(&data, path)?;
                let cleaned = json_value_to_text(value).trim_matches('\n').to_string();
                Ok(ParseOutput::from_text(cleaned))
            }
            Parser::TaggedLine { pattern } => {
                let mut lines = Vec::new();
                for raw in text.lines() {
                    if let Some(caps) = pattern.captures(raw.trim()) {
                        let value = caps
                            .name("text")
                            .map(|m| m.as_str())
                            .or_else(|| caps.get(2).map(|m| m.as_str()))
                            .unwrap_or_default();
                        lines.push(value.to_string());
                    }
                }
                if lines.is_empty() {
                    return Err(ParserError("TaggedLineParser: no tagged lines found".into()));
                }
                Ok(ParseOutput {
                    text: lines.join("\n"),
                    lines,
                })
            }
            Parser::Regex { pattern, group } => {
                let caps = pattern
                    .captures(text)
                    .ok_or_else(|| ParserError("RegexParser: pattern not matched".into()))?;
                let matched = match group {
                    GroupRef::Index(idx) => caps.get(*idx).map(|m| m.as_str()),
                    GroupRef::Name(name) => caps.name(name).map(|m| m.as_str()),
                };
                let extracted =
                    matched.ok_or_else(|| ParserError("RegexParser: invalid group".into()))?;
                Ok(ParseOutput::from_text(
                    extracted.trim_matches('\n').to_string(),
                ))
            }
        }
    }
}

fn flag_names(raw: Option<&serde_yaml::value::Value>) -> Vec<String> {
    match raw {
        Some(serde_yaml::Value::String(s)) => s
            .split(',')
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect(),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

fn get_by_path<'a>(
    data: &'a serde_json::Value,
    path: &str,
) -> Result<&'a serde_json::Value, ParserError> {
    let mut current = data;
    for part in path.split('.') {
        if part.is_empty() {
            continue;
        }
        current = match current {
            serde_json::Value::Array(items) => {
                let index: usize = part
                    .parse()
                    .map_err(|_| ParserError("JsonObjectParser: list index must be int".into()))?;
                items
                    .get(index)
                    .ok_or_else(|| ParserError("JsonObjectParser: list index out of range".into()))?
            }
            serde_json::Value::Object(map) => map
                .get(part)
                .ok_or_else(|| ParserError("JsonObjectParser: key not found".into()))?,
            _ => return Err(ParserError("JsonObjectParser: invalid path segment".into())),
        };
    }
    Ok(current)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
