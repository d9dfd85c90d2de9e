// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Text processing: rule engine, glossary, placeholder protection, quality
//! checks.
//!
//! A pipeline's `processing` block configures pre rules (applied to source
//! text before prompting), post rules (applied to model output), a glossary,
//! and flags.  The [`Processor`] is built once per run; protector instances
//! are created per block and never shared across workers.

mod glossary;
mod protect;
mod quality;
mod rules;
mod script;

pub use glossary::{load_glossary, load_glossary_text, render_glossary};
pub use protect::{Protector, DEFAULT_PROTECT_PATTERNS, SUBTITLE_PROTECT_PATTERNS};
pub use quality::{QualityChecker, QualityWarning};
pub use rules::{resolve_rules, validate_regex, Rule, RuleProcessor};
pub use script::{validate_script, ScriptRule};

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub struct ProcessingOptions {
    pub rules_pre: Vec<Rule>,
    pub rules_post: Vec<Rule>,
    pub glossary: BTreeMap<String, String>,
    pub source_lang: String,
    pub strict_line_count: bool,
    pub enable_quality: bool,
    pub enable_text_protect: bool,
    /// Restrict the default protector patterns to legal subtitle tags.
    pub subtitle_protection: bool,
}

pub struct Processor {
    options: ProcessingOptions,
    pre: RuleProcessor,
    post: RuleProcessor,
    quality: Option<QualityChecker>,
    protect_patterns: Vec<String>,
}

impl Processor {
    pub fn new(mut options: ProcessingOptions) -> Self {
        if options.source_lang.trim().is_empty() {
            options.source_lang = "ja".to_string();
        }
        if options.enable_text_protect {
            let has_restore = options
                .rules_post
                .iter()
                .any(|rule| rule.pattern == "restore_protection");
            if !has_restore {
                options.rules_post.push(Rule {
                    rule_type: "format".into(),
                    pattern: "restore_protection".into(),
                    ..Default::default()
                });
            }
        }

        let base = if options.subtitle_protection {
            SUBTITLE_PROTECT_PATTERNS
        } else {
            DEFAULT_PROTECT_PATTERNS
        };
        let protect_patterns = protect::build_protect_patterns(
            &options.rules_pre,
            &options.rules_post,
            options.enable_text_protect,
            base,
        );

        let pre = RuleProcessor::new(options.rules_pre.clone());
        let post = RuleProcessor::new(options.rules_post.clone());
        let quality = options
            .enable_quality
            .then(|| QualityChecker::new(options.glossary.clone()));

        Self {
            options,
            pre,
            post,
            quality,
            protect_patterns,
        }
    }

    pub fn options(&self) -> &ProcessingOptions {
        &self.options
    }

    pub fn has_pre_rules(&self) -> bool {
        !self.options.rules_pre.is_empty()
    }

    pub fn has_post_rules(&self) -> bool {
        !self.options.rules_post.is_empty()
    }

    /// Per-block protector, `None` when protection resolved to no patterns.
    pub fn create_protector(&self) -> Option<Protector> {
        if self.protect_patterns.is_empty() {
            return None;
        }
        Some(Protector::new(&self.protect_patterns))
    }

    pub fn apply_pre(&self, text: &str) -> String {
        if !self.has_pre_rules() {
            return text.to_string();
        }
        self.pre
            .process(text, None, None, self.options.strict_line_count)
    }

    pub fn apply_post(
        &self,
        text: &str,
        src_text: Option<&str>,
        protector: Option<&Protector>,
    ) -> String {
        if !self.has_post_rules() && protector.is_none() {
            return text.to_string();
        }
        self.post
            .process(text, src_text, protector, self.options.strict_line_count)
    }

    /// Run the quality checker over aligned line vectors.  Empty lines are
    /// filtered on both sides first so formatting differences do not drown the
    /// report.
    pub fn check_quality(
        &self,
        source_lines: &[String],
        output_lines: &[String],
    ) -> Vec<QualityWarning> {
        let Some(quality) = &self.quality else {
            return Vec::new();
        };
        let src: Vec<String> = source_lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .cloned()
            .collect();
        let dst: Vec<String> = output_lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .cloned()
            .collect();
        let mut lang = self.options.source_lang.to_ascii_lowercase();
        if lang == "jp" {
            lang = "ja".to_string();
        }
        quality.check_output(&src, &dst, &lang)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
