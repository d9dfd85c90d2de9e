// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Output quality checks.
//!
//! Non-fatal heuristics over aligned source/output lines: script residue,
//! empty output, suspiciously similar lines, and glossary terms that did not
//! make it into the translation.  Warnings are reported, never enforced.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct QualityWarning {
    #[serde(rename = "type")]
    pub warning_type: String,
    /// 1-based line number; 0 for whole-document warnings.
    pub line: usize,
    pub message: String,
}

pub struct QualityChecker {
    glossary: BTreeMap<String, String>,
}

fn is_hiragana(c: char) -> bool {
    ('\u{3040}'..='\u{309F}').contains(&c)
}

fn is_katakana(c: char) -> bool {
    ('\u{30A0}'..='\u{30FF}').contains(&c)
}

fn is_hangeul(c: char) -> bool {
    ('\u{AC00}'..='\u{D7AF}').contains(&c) || ('\u{1100}'..='\u{11FF}').contains(&c)
}

impl QualityChecker {
    pub fn new(glossary: BTreeMap<String, String>) -> Self {
        Self { glossary }
    }

    pub fn check_output(
        &self,
        source_lines: &[String],
        output_lines: &[String],
        source_lang: &str,
    ) -> Vec<QualityWarning> {
        let mut warnings = Vec::new();

        if source_lines.len() != output_lines.len() {
            warnings.push(QualityWarning {
                warning_type: "line_mismatch".into(),
                line: 0,
                message: format!(
                    "line count mismatch: {} source vs {} output (blank lines ignored)",
                    source_lines.len(),
                    output_lines.len()
                ),
            });
        }

        for (idx, (src, dst)) in source_lines.iter().zip(output_lines.iter()).enumerate() {
            let line = idx + 1;

            if !src.trim().is_empty() && dst.trim().is_empty() {
                warnings.push(QualityWarning {
                    warning_type: "empty_output".into(),
                    line,
                    message: format!("line {line}: output empty for non-empty source"),
                });
                continue;
            }

            if source_lang == "ja" {
                warnings.extend(check_kana_residue(dst, line));
            }
            if source_lang == "ko" {
                warnings.extend(check_hangeul_residue(dst, line));
            }

            if is_high_similarity(src, dst) {
                warnings.push(QualityWarning {
                    warning_type: "high_similarity".into(),
                    line,
                    message: format!("line {line}: output nearly identical to source (untranslated?)"),
                });
            }

            warnings.extend(self.check_glossary(src, dst, line));
        }

        warnings
    }

    /// A source term present in `src` whose rendering is absent from `dst`.
    fn check_glossary(&self, src: &str, dst: &str, line: usize) -> Vec<QualityWarning> {
        let mut warnings = Vec::new();
        for (term_src, term_dst) in &self.glossary {
            if term_src.is_empty() || term_dst.is_empty() {
                continue;
            }
            if src.contains(term_src.as_str()) && !dst.contains(term_dst.as_str()) {
                warnings.push(QualityWarning {
                    warning_type: "glossary_missed".into(),
                    line,
                    message: format!("line {line}: term '{term_src}' -> '{term_dst}' not applied"),
                });
            }
        }
        warnings
    }
}

fn check_kana_residue(text: &str, line: usize) -> Vec<QualityWarning> {
    let mut warnings = Vec::new();
    // ー and ・ also appear in legitimate Chinese renderings of loanwords.
    let hiragana: String = text
        .chars()
        .filter(|c| is_hiragana(*c) && !matches!(*c, 'ー' | '・'))
        .collect();
    let katakana: Vec<char> = text
        .chars()
        .filter(|c| is_katakana(*c) && !matches!(*c, 'ー' | '・'))
        .collect();

    if !hiragana.is_empty() {
        let sample: String = hiragana.chars().take(5).collect();
        warnings.push(QualityWarning {
            warning_type: "kana_residue".into(),
            line,
            message: format!("line {line}: hiragana residue: {sample}..."),
        });
    }
    // Katakana may be a transliterated loanword; only flag longer runs.
    if katakana.len() > 3 {
        let sample: String = katakana.iter().take(5).collect();
        warnings.push(QualityWarning {
            warning_type: "kana_residue".into(),
            line,
            message: format!("line {line}: katakana residue: {sample}..."),
        });
    }
    warnings
}

fn check_hangeul_residue(text: &str, line: usize) -> Vec<QualityWarning> {
    let hangeul: Vec<char> = text.chars().filter(|c| is_hangeul(*c)).collect();
    if hangeul.is_empty() {
        return Vec::new();
    }
    let sample: String = hangeul.iter().take(5).collect();
    vec![QualityWarning {
        warning_type: "hangeul_residue".into(),
        line,
        message: format!("line {line}: hangeul residue: {sample}..."),
    }]
}

fn is_high_similarity(src: &str, dst: &str) -> bool {
    let src = src.trim();
    let dst = dst.trim();
    if src.is_empty() || dst.is_empty() {
        return false;
    }
    if src == dst {
        return true;
    }
    if src.contains(dst) || dst.contains(src) {
        return true;
    }
    // Short lines (symbols, names, interjections) are exempt.
    if src.chars().count() < 10 {
        return false;
    }
    jaccard_chars(src, dst) > 0.8
}

fn jaccard_chars(a: &str, b: &str) -> f64 {
    let a_set: HashSet<char> = a.chars().collect();
    let b_set: HashSet<char> = b.chars().collect();
    let union = a_set.union(&b_set).count();
    if union == 0 {
        return 0.0;
    }
    a_set.intersection(&b_set).count() as f64 / union as f64
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
