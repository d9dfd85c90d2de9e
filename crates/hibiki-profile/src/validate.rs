// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Save-time profile validation.
//!
//! Issues split into errors (reject the save) and warnings (persist but
//! flag).  Unknown enum values are warnings so forward-compatible profiles
//! survive older binaries.

use serde_yaml::{Mapping, Value};

use crate::store::ProfileStore;

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

fn get_str(data: &Mapping, key: &str) -> String {
    data.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn has_value(data: &Mapping, key: &str) -> bool {
    match data.get(key) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(_) => true,
    }
}

fn ensure_field(data: &Mapping, field: &str, result: &mut ValidationResult) {
    if !has_value(data, field) {
        result.errors.push(format!("missing_field:{field}"));
    }
}

fn warn_unknown_type(value: &str, result: &mut ValidationResult) {
    if !value.is_empty() {
        result.warnings.push(format!("unsupported_type:{value}"));
    }
}

pub fn validate_profile(
    kind: &str,
    data: &Mapping,
    store: Option<&ProfileStore>,
) -> ValidationResult {
    let mut result = ValidationResult::default();

    if !has_value(data, "id") {
        result.errors.push("missing_id".to_string());
    }

    match kind {
        "api" => {
            let api_type = {
                let t = get_str(data, "type");
                if t.is_empty() {
                    let p = get_str(data, "provider");
                    if p.is_empty() {
                        "openai_compat".to_string()
                    } else {
                        p
                    }
                } else {
                    t
                }
            };
            match api_type.as_str() {
                "openai_compat" => {
                    if !has_value(data, "base_url") {
                        result.errors.push("missing_base_url".to_string());
                    }
                    if !has_value(data, "model") {
                        result.errors.push("missing_model".to_string());
                    }
                }
                "pool" => {
                    let endpoints = data.get("endpoints");
                    let ok = matches!(endpoints, Some(Value::Sequence(s)) if !s.is_empty());
                    if !ok {
                        result.errors.push("missing_endpoints".to_string());
                    }
                }
                other => warn_unknown_type(other, &mut result),
            }
        }
        "parser" => {
            let parser_type = get_str(data, "type");
            if parser_type.is_empty() {
                result.errors.push("missing_field:type".to_string());
            } else if !matches!(
                parser_type.as_str(),
                "plain" | "line_strict" | "json_array" | "json_object" | "tagged_line" | "regex"
            ) {
                warn_unknown_type(&parser_type, &mut result);
            }
            let options = data
                .get("options")
                .and_then(|v| v.as_mapping())
                .cloned()
                .unwrap_or_default();
            if parser_type == "regex" && !has_value(&options, "pattern") {
                result.errors.push("missing_pattern".to_string());
            }
            if parser_type == "json_object"
                && !has_value(&options, "path")
                && !has_value(&options, "key")
            {
                result.errors.push("missing_json_path".to_string());
            }
        }
        "policy" => {
            let policy_type = get_str(data, "type");
            if policy_type.is_empty() {
                result.errors.push("missing_field:type".to_string());
            } else if !matches!(policy_type.as_str(), "strict" | "tolerant") {
                warn_unknown_type(&policy_type, &mut result);
            }
        }
        "chunk" => {
            let chunk_type = {
                let t = get_str(data, "chunk_type");
                if t.is_empty() {
                    get_str(data, "type")
                } else {
                    t
                }
            };
            if chunk_type.is_empty() {
                result.errors.push("missing_field:chunk_type".to_string());
            } else if !matches!(chunk_type.as_str(), "legacy" | "block" | "line") {
                warn_unknown_type(&chunk_type, &mut result);
            }
        }
        "pipeline" => {
            for field in ["provider", "prompt", "parser", "chunk_policy"] {
                ensure_field(data, field, &mut result);
            }
            let apply = data
                .get("apply_line_policy")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if apply && !has_value(data, "line_policy") {
                result.errors.push("missing_field:line_policy".to_string());
            }

            if let Some(store) = store {
                let ref_map = [
                    ("provider", "api"),
                    ("prompt", "prompt"),
                    ("parser", "parser"),
                    ("line_policy", "policy"),
                    ("chunk_policy", "chunk"),
                ];
                for (field, ref_kind) in ref_map {
                    let ref_id = get_str(data, field);
                    if !ref_id.is_empty() && store.resolve(ref_kind, &ref_id).is_none() {
                        result
                            .warnings
                            .push(format!("missing_reference:{ref_kind}:{ref_id}"));
                    }
                }
            }
        }
        _ => {}
    }

    result
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
