// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Chunk policies: items → translation blocks.
//!
//! `block` merges items up to a size target with a "rubber band" rule that
//! only closes a chunk on safe sentence-ending punctuation, vetoing splits
//! after digit-bearing lines (numbered headings mid-sentence are a
//! hallucination magnet).  `line` is the identity strategy: one block per
//! item.

use thiserror::Error;

use hibiki_document::{Item, ItemMeta, TextBlock};
use hibiki_profile::ChunkProfile;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChunkError(pub String);

/// Punctuation a chunk may close on once the size target is near.
const SAFE_PUNCTUATION: &[&str] = &["。", "！", "？", "……", "”", "」", "\n"];

#[derive(Debug, Clone)]
pub struct BlockOptions {
    pub target_chars: usize,
    pub max_chars: usize,
    pub enable_balance: bool,
    pub balance_threshold: f64,
    pub balance_count: usize,
}

#[derive(Debug, Clone)]
pub struct LineOptions {
    pub strict: bool,
    pub keep_empty: bool,
    keep_empty_explicit: bool,
}

#[derive(Debug, Clone)]
pub enum ChunkPolicy {
    Block(BlockOptions),
    Line(LineOptions),
}

impl ChunkPolicy {
    pub fn from_profile(profile: &ChunkProfile) -> Result<Self, ChunkError> {
        let options = &profile.options;
        match profile.chunk_type.trim() {
            "block" | "legacy" | "chunk" => {
                let target_chars = options.target_chars.unwrap_or(1000).max(1);
                let max_chars = options.max_chars.unwrap_or(target_chars * 2).max(target_chars);
                Ok(ChunkPolicy::Block(BlockOptions {
                    target_chars,
                    max_chars,
                    enable_balance: options.enable_balance.unwrap_or(true),
                    balance_threshold: options.balance_threshold.unwrap_or(0.6),
                    balance_count: options.balance_count.unwrap_or(3),
                }))
            }
            "line" => {
                let strict = options.strict.unwrap_or(false);
                Ok(ChunkPolicy::Line(LineOptions {
                    strict,
                    keep_empty: options.keep_empty.unwrap_or(strict),
                    keep_empty_explicit: options.keep_empty.is_some(),
                }))
            }
            other => Err(ChunkError(format!("unknown chunk type: {other}"))),
        }
    }

    pub fn chunk_type(&self) -> &'static str {
        match self {
            ChunkPolicy::Block(_) => "block",
            ChunkPolicy::Line(_) => "line",
        }
    }

    pub fn is_line(&self) -> bool {
        matches!(self, ChunkPolicy::Line(_))
    }

    /// Force `keep_empty` unless the profile set it explicitly.  Subtitle
    /// documents need empty cue lines to keep their 1:1 correspondence.
    pub fn force_keep_empty(&mut self) {
        if let ChunkPolicy::Line(options) = self {
            if !options.keep_empty_explicit {
                options.keep_empty = true;
            }
        }
    }

    pub fn chunk(&self, items: &[Item]) -> Vec<TextBlock> {
        match self {
            ChunkPolicy::Line(options) => chunk_per_line(items, options),
            ChunkPolicy::Block(options) => chunk_rubber_band(items, options),
        }
    }
}

fn chunk_per_line(items: &[Item], options: &LineOptions) -> Vec<TextBlock> {
    let mut blocks = Vec::new();
    for item in items {
        let line = item.text.trim_end_matches('\n');
        let content = if options.strict {
            line
        } else {
            if line.trim().is_empty() && !options.keep_empty {
                continue;
            }
            if options.keep_empty {
                line
            } else {
                line.trim()
            }
        };
        blocks.push(TextBlock::new(
            blocks.len() + 1,
            content,
            vec![item.meta.clone()],
        ));
    }
    blocks
}

fn chunk_rubber_band(items: &[Item], options: &BlockOptions) -> Vec<TextBlock> {
    let mut blocks: Vec<TextBlock> = Vec::new();
    let mut chunk_text: Vec<&str> = Vec::new();
    let mut chunk_meta: Vec<ItemMeta> = Vec::new();
    let mut char_count = 0usize;

    for item in items {
        chunk_text.push(&item.text);
        chunk_meta.push(item.meta.clone());
        char_count += item.text.chars().count();

        let stripped = item.text.trim();
        // Numeric veto: never close right after a digit-bearing line unless
        // the hard maximum forces it.
        let numeric_risky = item.text.chars().any(|c| c.is_ascii_digit());

        if char_count >= options.target_chars.saturating_sub(30) {
            let mut safe_punct = SAFE_PUNCTUATION.iter().any(|p| stripped.ends_with(p));
            if numeric_risky && char_count < options.max_chars {
                safe_punct = false;
            }
            if safe_punct || char_count >= options.max_chars {
                push_block(&mut blocks, &mut chunk_text, &mut chunk_meta);
                char_count = 0;
            }
        }
    }
    push_block(&mut blocks, &mut chunk_text, &mut chunk_meta);

    if options.enable_balance && blocks.len() >= 2 {
        balance_tail(&mut blocks, options);
    }
    blocks
}

fn push_block(blocks: &mut Vec<TextBlock>, lines: &mut Vec<&str>, meta: &mut Vec<ItemMeta>) {
    let text: String = lines.concat();
    lines.clear();
    let meta = std::mem::take(meta);
    if text.trim().is_empty() {
        return;
    }
    blocks.push(TextBlock::new(blocks.len() + 1, text, meta));
}

/// Merge the last N blocks and redistribute greedily by line when the final
/// block came out short.  Structured documents (token metadata) are exempt:
/// redistribution would detach text from its decoder positions.  Only
/// `prompt_text` moves; metadata stays with its original block so the
/// cross-block metadata order is untouched.
fn balance_tail(blocks: &mut [TextBlock], options: &BlockOptions) {
    let structured = blocks
        .iter()
        .any(|b| b.metadata.iter().any(|m| matches!(m, ItemMeta::Token(_))));
    if structured {
        return;
    }

    let n = blocks.len().min(options.balance_count);
    if n < 2 {
        return;
    }

    let last_len = blocks[blocks.len() - 1].prompt_text.chars().count();
    let threshold = options.target_chars as f64 * options.balance_threshold;
    if last_len as f64 >= threshold {
        return;
    }

    let start = blocks.len() - n;
    let combined: String = blocks[start..].iter().map(|b| b.prompt_text.as_str()).collect();
    let lines: Vec<&str> = split_keepends(&combined);
    let total_len: usize = lines.iter().map(|l| l.chars().count()).sum();
    let ideal = total_len / n;

    let mut new_texts: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;
    for line in lines {
        current.push_str(line);
        current_len += line.chars().count();
        if new_texts.len() < n - 1 && current_len >= ideal {
            new_texts.push(std::mem::take(&mut current));
            current_len = 0;
        }
    }
    if !current.is_empty() {
        new_texts.push(current);
    }

    for i in 0..n {
        blocks[start + i].prompt_text = new_texts.get(i).cloned().unwrap_or_default();
    }
}

/// `str::split_inclusive` equivalent of Python's `splitlines(keepends=True)`
/// restricted to `\n`.
fn split_keepends(text: &str) -> Vec<&str> {
    if text.is_empty() {
        return Vec::new();
    }
    text.split_inclusive('\n').collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
