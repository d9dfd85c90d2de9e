// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Line policies: post-parse alignment and per-line quality checks.

use std::collections::HashSet;

use thiserror::Error;

use hibiki_profile::{PolicyOptions, PolicyProfile};

use crate::aligner::align_lines;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct LinePolicyError(pub String);

#[derive(Debug, Clone)]
pub enum LinePolicy {
    Strict(PolicyOptions),
    Tolerant(PolicyOptions),
}

impl LinePolicy {
    pub fn from_profile(profile: &PolicyProfile) -> Result<Self, LinePolicyError> {
        match profile.policy_type.trim() {
            "strict" => Ok(LinePolicy::Strict(profile.options.clone())),
            "tolerant" => Ok(LinePolicy::Tolerant(profile.options.clone())),
            other => Err(LinePolicyError(format!("unknown line policy type: {other}"))),
        }
    }

    /// Align `output_lines` onto the source grid and run the configured
    /// checks.  Strict mode reacts to count mismatches per `on_mismatch`;
    /// tolerant mode always aligns.
    pub fn apply(
        &self,
        source_lines: &[String],
        output_lines: Vec<String>,
    ) -> Result<Vec<String>, LinePolicyError> {
        let (options, result) = match self {
            LinePolicy::Strict(options) => {
                let result = if source_lines.len() == output_lines.len() {
                    output_lines
                } else {
                    match options.on_mismatch.as_deref().unwrap_or("error") {
                        "retry" | "error" => {
                            return Err(LinePolicyError(format!(
                                "StrictLinePolicy mismatch: src={} dst={}",
                                source_lines.len(),
                                output_lines.len()
                            )))
                        }
                        "pad" => pad_or_truncate(output_lines, source_lines.len()),
                        "truncate" => truncate_only(output_lines, source_lines.len()),
                        "align" => align_lines(source_lines, &output_lines),
                        _ => {
                            return Err(LinePolicyError(format!(
                                "StrictLinePolicy mismatch: src={} dst={}",
                                source_lines.len(),
                                output_lines.len()
                            )))
                        }
                    }
                };
                (options, result)
            }
            LinePolicy::Tolerant(options) => {
                let result = if source_lines.len() == output_lines.len() {
                    output_lines
                } else {
                    align_lines(source_lines, &output_lines)
                };
                (options, result)
            }
        };
        run_line_checks(source_lines, &result, options)?;
        Ok(result)
    }
}

fn pad_or_truncate(mut lines: Vec<String>, target_len: usize) -> Vec<String> {
    if lines.len() < target_len {
        lines.resize(target_len, String::new());
        lines
    } else {
        lines.truncate(target_len);
        lines
    }
}

fn truncate_only(mut lines: Vec<String>, target_len: usize) -> Vec<String> {
    if lines.len() > target_len {
        lines.truncate(target_len);
    }
    lines
}

// ── Checks ────────────────────────────────────────────────────────────────────

fn is_kana(c: char) -> bool {
    matches!(c, '\u{3040}'..='\u{309F}' | '\u{30A0}'..='\u{30FF}')
}

fn is_cjk_or_kana(c: char) -> bool {
    matches!(
        c,
        '\u{3040}'..='\u{309F}'
            | '\u{30A0}'..='\u{30FF}'
            | '\u{3400}'..='\u{4DBF}'
            | '\u{4E00}'..='\u{9FFF}'
            | '\u{F900}'..='\u{FAFF}'
    )
}

fn count_cjk_kana(text: &str) -> usize {
    text.chars().filter(|c| is_cjk_or_kana(*c)).count()
}

/// Whitespace-compacted lowercase character bigrams.
fn char_bigrams(text: &str) -> HashSet<String> {
    let compact: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if compact.is_empty() {
        return HashSet::new();
    }
    if compact.len() == 1 {
        return HashSet::from([compact[0].to_string()]);
    }
    compact
        .windows(2)
        .map(|pair| pair.iter().collect())
        .collect()
}

fn jaccard_score(a: &str, b: &str) -> f64 {
    let a_set = char_bigrams(a);
    let b_set = char_bigrams(b);
    if a_set.is_empty() || b_set.is_empty() {
        return 0.0;
    }
    let intersection = a_set.intersection(&b_set).count();
    let union = a_set.union(&b_set).count();
    intersection as f64 / union as f64
}

fn run_line_checks(
    source_lines: &[String],
    output_lines: &[String],
    options: &PolicyOptions,
) -> Result<(), LinePolicyError> {
    let checks: HashSet<String> = options
        .checks
        .as_ref()
        .map(|c| c.enabled().into_iter().collect())
        .unwrap_or_default();
    if checks.is_empty() {
        return Ok(());
    }

    let trim = options.trim.unwrap_or(true);
    let similarity_threshold = options.similarity_threshold.unwrap_or(0.8);
    let source_lang = options
        .source_lang
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    for (idx, (src, dst)) in source_lines.iter().zip(output_lines.iter()).enumerate() {
        let src_norm = if trim { src.trim() } else { src.as_str() };
        let dst_norm = if trim { dst.trim() } else { dst.as_str() };

        if checks.contains("empty_line") && !src_norm.is_empty() && dst_norm.is_empty() {
            return Err(LinePolicyError(format!("LineCheck:empty_line:{idx}")));
        }

        if checks.contains("kana_trace")
            && matches!(source_lang.as_str(), "ja" | "jp")
            && dst_norm.chars().any(is_kana)
        {
            return Err(LinePolicyError(format!("LineCheck:kana_trace:{idx}")));
        }

        if checks.contains("similarity") && !src_norm.is_empty() && !dst_norm.is_empty() {
            // Short source lines (names, interjections) legitimately survive
            // translation unchanged.
            if count_cjk_kana(src_norm) < 10 {
                continue;
            }
            if src_norm.contains(dst_norm) || dst_norm.contains(src_norm) {
                return Err(LinePolicyError(format!("LineCheck:similarity:{idx}")));
            }
            if jaccard_score(src_norm, dst_norm) >= similarity_threshold {
                return Err(LinePolicyError(format!("LineCheck:similarity:{idx}")));
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn policy(yaml: &str) -> LinePolicy {
        let profile: PolicyProfile = serde_yaml::from_str(yaml).unwrap();
        LinePolicy::from_profile(&profile).unwrap()
    }

    #[test]
    fn strict_matching_counts_pass_through() {
        let p = policy("id: p\ntype: strict");
        let out = p
            .apply(&lines(&["a", "b"]), lines(&["x", "y"]))
            .unwrap();
        assert_eq!(out, lines(&["x", "y"]));
    }

    #[test]
    fn strict_default_mismatch_is_error() {
        let p = policy("id: p\ntype: strict");
        let err = p.apply(&lines(&["a", "b"]), lines(&["x"])).unwrap_err();
        assert!(err.0.contains("mismatch: src=2 dst=1"));
    }

    #[test]
    fn strict_retry_raises() {
        let p = policy("id: p\ntype: strict\noptions:\n  on_mismatch: retry");
        assert!(p.apply(&lines(&["a", "b"]), lines(&["x"])).is_err());
    }

    #[test]
    fn strict_pad_appends_empty_strings() {
        let p = policy("id: p\ntype: strict\noptions:\n  on_mismatch: pad");
        let out = p
            .apply(&lines(&["a", "b", "c"]), lines(&["x"]))
            .unwrap();
        assert_eq!(out, lines(&["x", "", ""]));
    }

    #[test]
    fn strict_pad_also_truncates_surplus() {
        let p = policy("id: p\ntype: strict\noptions:\n  on_mismatch: pad");
        let out = p.apply(&lines(&["a"]), lines(&["x", "y"])).unwrap();
        assert_eq!(out, lines(&["x"]));
    }

    #[test]
    fn strict_truncate_drops_surplus_only() {
        let p = policy("id: p\ntype: strict\noptions:\n  on_mismatch: truncate");
        let out = p.apply(&lines(&["a"]), lines(&["x", "y"])).unwrap();
        assert_eq!(out, lines(&["x"]));
        // Deficit is left alone.
        let out = p.apply(&lines(&["a", "b"]), lines(&["x"])).unwrap();
        assert_eq!(out, lines(&["x"]));
    }

    #[test]
    fn strict_align_delegates_to_aligner() {
        let p = policy("id: p\ntype: strict\noptions:\n  on_mismatch: align");
        let out = p
            .apply(&lines(&["a", "", "c"]), lines(&["x", "y"]))
            .unwrap();
        assert_eq!(out, lines(&["x", "", "y"]));
    }

    #[test]
    fn tolerant_always_aligns() {
        let p = policy("id: p\ntype: tolerant");
        let out = p
            .apply(&lines(&["a", "b", "c"]), lines(&["x"]))
            .unwrap();
        assert_eq!(out, lines(&["x", "", ""]));
    }

    #[test]
    fn unknown_policy_type_rejected() {
        let profile: PolicyProfile = serde_yaml::from_str("id: p\ntype: fuzzy").unwrap();
        assert!(LinePolicy::from_profile(&profile).is_err());
    }

    // ── Checks ───────────────────────────────────────────────────────────────

    #[test]
    fn empty_line_check_fails_on_dropped_content() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [empty_line]");
        let err = p
            .apply(&lines(&["内容", ""]), lines(&["", ""]))
            .unwrap_err();
        assert!(err.0.contains("empty_line:0"));
    }

    #[test]
    fn empty_source_line_passes_empty_check() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [empty_line]");
        assert!(p.apply(&lines(&["", "a"]), lines(&["", "x"])).is_ok());
    }

    #[test]
    fn kana_trace_only_for_japanese_source() {
        let yaml_ja = "id: p\ntype: strict\noptions:\n  source_lang: ja\n  checks: [kana_trace]";
        let err = policy(yaml_ja)
            .apply(&lines(&["何か"]), lines(&["残ったかな"]))
            .unwrap_err();
        assert!(err.0.contains("kana_trace:0"));

        let yaml_ko = "id: p\ntype: strict\noptions:\n  source_lang: ko\n  checks: [kana_trace]";
        assert!(policy(yaml_ko)
            .apply(&lines(&["뭔가"]), lines(&["残ったかな"]))
            .is_ok());
    }

    #[test]
    fn similarity_ignores_short_sources() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [similarity]");
        // Fewer than 10 CJK chars: containment tolerated.
        assert!(p.apply(&lines(&["短い文"]), lines(&["短い文"])).is_ok());
    }

    #[test]
    fn similarity_rejects_untranslated_long_line() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [similarity]");
        let long = "これはとても長い日本語の文章でした";
        let err = p
            .apply(&lines(&[long]), lines(&[long]))
            .unwrap_err();
        assert!(err.0.contains("similarity:0"));
    }

    #[test]
    fn similarity_containment_either_direction_fails() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [similarity]");
        let src = "これはとても長い日本語の文章でした";
        let dst = format!("訳: {src}");
        assert!(p.apply(&lines(&[src]), vec![dst]).is_err());
    }

    #[test]
    fn similarity_accepts_genuine_translation() {
        let p = policy("id: p\ntype: strict\noptions:\n  checks: [similarity]");
        let src = "これはとても長い日本語の文章でした";
        let dst = "这是一段很长的中文译文内容";
        assert!(p.apply(&lines(&[src]), lines(&[dst])).is_ok());
    }

    #[test]
    fn jaccard_bigram_basics() {
        assert_eq!(jaccard_score("abcd", "abcd"), 1.0);
        assert_eq!(jaccard_score("", "abcd"), 0.0);
        assert!(jaccard_score("abcd", "wxyz") < 0.01);
    }

    #[test]
    fn checks_respect_disabled_map_entries() {
        let p = policy(
            "id: p\ntype: strict\noptions:\n  checks:\n    empty_line: false",
        );
        assert!(p.apply(&lines(&["内容"]), lines(&[""])).is_ok());
    }
}
