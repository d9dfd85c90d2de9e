// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Prompt assembly from a prompt profile.
//!
//! Templates use `{{name}}` tokens with names matching
//! `[a-zA-Z_][a-zA-Z0-9_]*`.  Expansion is a single pass: the output is never
//! re-scanned, so a `source` containing `{{glossary}}` stays literal instead
//! of pulling the glossary into the user message.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};

use hibiki_profile::PromptProfile;
use hibiki_provider::Message;

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{([a-zA-Z_][a-zA-Z0-9_]*)\}\}").unwrap())
}

/// Expand `{{name}}` tokens from `mapping` in one pass.  Unknown names stay
/// verbatim.
pub fn render_template(template: &str, mapping: &HashMap<&str, String>) -> String {
    token_pattern()
        .replace_all(template, |caps: &Captures| {
            mapping
                .get(caps.get(1).unwrap().as_str())
                .cloned()
                .unwrap_or_else(|| caps.get(0).unwrap().as_str().to_string())
        })
        .into_owned()
}

/// Values available to prompt templates for one block.
#[derive(Debug, Default, Clone)]
pub struct PromptInputs {
    pub source: String,
    pub context_before: String,
    pub context_after: String,
    pub glossary: String,
    /// Present only for line-mode blocks.
    pub line_index: Option<usize>,
}

/// Assemble the system/user messages for one block.
///
/// The system message concatenates the non-empty expansions of `persona`,
/// `style_rules`, `output_rules`, and `system_template`, separated by blank
/// lines.  `user_template` becomes the user message; when nothing produced a
/// user message the raw source is sent as the sole user message.
pub fn build_messages(profile: &PromptProfile, inputs: &PromptInputs) -> Vec<Message> {
    let mapping: HashMap<&str, String> = HashMap::from([
        ("source", inputs.source.clone()),
        ("context_before", inputs.context_before.clone()),
        ("context_after", inputs.context_after.clone()),
        ("glossary", inputs.glossary.clone()),
        (
            "line_index",
            inputs.line_index.map(|i| i.to_string()).unwrap_or_default(),
        ),
        (
            "line_number",
            inputs
                .line_index
                .map(|i| (i + 1).to_string())
                .unwrap_or_default(),
        ),
    ]);

    let trimmed = |raw: &Option<String>| -> String {
        raw.as_deref()
            .unwrap_or("")
            .trim_matches('\n')
            .to_string()
    };

    let mut messages = Vec::new();

    let mut system_parts = Vec::new();
    for part in [
        trimmed(&profile.persona),
        trimmed(&profile.style_rules),
        trimmed(&profile.output_rules),
        trimmed(&profile.system_template),
    ] {
        if !part.is_empty() {
            let rendered = render_template(&part, &mapping);
            let rendered = rendered.trim_matches('\n');
            if !rendered.is_empty() {
                system_parts.push(rendered.to_string());
            }
        }
    }
    if !system_parts.is_empty() {
        messages.push(Message::system(system_parts.join("\n\n")));
    }

    let user_template = trimmed(&profile.user_template);
    if !user_template.is_empty() {
        let rendered = render_template(&user_template, &mapping);
        messages.push(Message::user(rendered.trim_matches('\n')));
    } else {
        // No user message would be produced: send the raw source as the sole
        // user message.
        messages.push(Message::user(inputs.source.clone()));
    }
    messages
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hibiki_provider::Role;

    fn profile(yaml: &str) -> PromptProfile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn unknown_tokens_stay_verbatim() {
        let mapping = HashMap::from([("source", "S".to_string())]);
        assert_eq!(
            render_template("{{source}} {{unknown}}", &mapping),
            "S {{unknown}}"
        );
    }

    #[test]
    fn malformed_tokens_not_expanded() {
        let mapping = HashMap::from([("source", "S".to_string())]);
        assert_eq!(render_template("{{ source }}", &mapping), "{{ source }}");
        assert_eq!(render_template("{{1bad}}", &mapping), "{{1bad}}");
    }

    #[test]
    fn single_pass_prevents_injection_from_source() {
        let p = profile("id: p\nuser_template: \"Translate: {{source}}\"");
        let inputs = PromptInputs {
            source: "{{glossary}}".into(),
            glossary: "SECRET".into(),
            ..Default::default()
        };
        let messages = build_messages(&p, &inputs);
        let user = &messages.last().unwrap().content;
        assert!(user.contains("{{glossary}}"));
        assert!(!user.contains("SECRET"));
    }

    #[test]
    fn system_parts_joined_by_blank_lines_in_order() {
        let p = profile(
            "id: p\npersona: A\nstyle_rules: B\noutput_rules: C\nsystem_template: D\nuser_template: \"{{source}}\"",
        );
        let messages = build_messages(&p, &PromptInputs::default());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].content, "A\n\nB\n\nC\n\nD");
    }

    #[test]
    fn empty_parts_skipped() {
        let p = profile("id: p\npersona: \"\"\nsystem_template: Only\nuser_template: \"{{source}}\"");
        let messages = build_messages(&p, &PromptInputs::default());
        assert_eq!(messages[0].content, "Only");
    }

    #[test]
    fn raw_source_fallback_when_no_templates() {
        let p = profile("id: p");
        let inputs = PromptInputs {
            source: "just the text".into(),
            ..Default::default()
        };
        let messages = build_messages(&p, &inputs);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].content, "just the text");
    }

    #[test]
    fn line_number_is_one_based() {
        let p = profile("id: p\nuser_template: \"L{{line_index}}/N{{line_number}}\"");
        let inputs = PromptInputs {
            line_index: Some(4),
            ..Default::default()
        };
        let messages = build_messages(&p, &inputs);
        assert_eq!(messages[0].content, "L4/N5");
    }

    #[test]
    fn line_tokens_empty_outside_line_mode() {
        let p = profile("id: p\nuser_template: \"[{{line_index}}][{{line_number}}]\"");
        let messages = build_messages(&p, &PromptInputs::default());
        assert_eq!(messages[0].content, "[][]");
    }

    #[test]
    fn context_tokens_expand() {
        let p = profile(
            "id: p\nuser_template: \"{{context_before}}|{{source}}|{{context_after}}\"",
        );
        let inputs = PromptInputs {
            source: "b".into(),
            context_before: "a".into(),
            context_after: "c".into(),
            ..Default::default()
        };
        let messages = build_messages(&p, &inputs);
        assert_eq!(messages[0].content, "a|b|c");
    }
}
