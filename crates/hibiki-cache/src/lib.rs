// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Block-addressed translation cache.
//!
//! Results are stored per model call (one block) so a proofreading UI can
//! re-translate or hand-edit individual blocks later.  The on-disk format is
//! a single JSON document, version "2.0".  All access is serialised through
//! one mutex with an `index → position` map for O(1) block lookup.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::warn;

pub const CACHE_SUFFIX: &str = ".cache.json";

/// One cached translation block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheBlock {
    pub index: usize,
    /// Verbatim source text (newlines preserved).
    pub src: String,
    /// Verbatim translated text.
    pub dst: String,
    /// `none` | `processed` | `edited`.
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Chain-of-thought capture for debugging.
    #[serde(default)]
    pub cot: String,
    #[serde(default, rename = "retryHistory")]
    pub retry_history: Vec<serde_json::Value>,
}

fn default_status() -> String {
    "processed".to_string()
}

impl CacheBlock {
    fn non_blank_lines(text: &str) -> usize {
        text.split('\n').filter(|l| !l.trim().is_empty()).count()
    }

    pub fn src_lines(&self) -> usize {
        Self::non_blank_lines(&self.src)
    }

    pub fn dst_lines(&self) -> usize {
        Self::non_blank_lines(&self.dst)
    }

    pub fn src_chars(&self) -> usize {
        self.src.chars().count()
    }

    pub fn dst_chars(&self) -> usize {
        self.dst.chars().count()
    }

    fn to_json(&self) -> serde_json::Value {
        let mut value = json!({
            "index": self.index,
            "src": self.src,
            "dst": self.dst,
            "status": self.status,
            "warnings": self.warnings,
            "cot": self.cot,
            "srcLines": self.src_lines(),
            "dstLines": self.dst_lines(),
        });
        // Only serialised when present, to keep large caches lean.
        if !self.retry_history.is_empty() {
            value["retryHistory"] = json!(self.retry_history);
        }
        value
    }
}

/// Metadata recorded alongside the blocks on save.
#[derive(Debug, Clone, Default)]
pub struct CacheMeta {
    pub model_name: String,
    pub glossary_path: String,
    pub concurrency: usize,
    /// `v1` | `v2`; anything else is dropped.
    pub engine_mode: String,
    /// `line` | `chunk` | `block` (`legacy` normalises to `block`).
    pub chunk_type: String,
    pub pipeline_id: String,
}

struct CacheState {
    blocks: Vec<CacheBlock>,
    index_map: HashMap<usize, usize>,
    source_path: String,
}

pub struct TranslationCache {
    output_path: String,
    cache_path: PathBuf,
    state: Mutex<CacheState>,
}

impl TranslationCache {
    /// `<output>.cache.json`, or `<cache_dir>/<basename>.cache.json` when a
    /// valid cache directory override is given.
    pub fn new(output_path: &str, cache_dir: Option<&Path>, source_path: &str) -> Self {
        let cache_path = match cache_dir.filter(|d| d.is_dir()) {
            Some(dir) => {
                let filename = Path::new(output_path)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| output_path.to_string());
                dir.join(format!("{filename}{CACHE_SUFFIX}"))
            }
            None => PathBuf::from(format!("{output_path}{CACHE_SUFFIX}")),
        };
        Self {
            output_path: output_path.to_string(),
            cache_path,
            state: Mutex::new(CacheState {
                blocks: Vec::new(),
                index_map: HashMap::new(),
                source_path: source_path.to_string(),
            }),
        }
    }

    pub fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    /// Insert or replace the block at `index` (O(1) via the index map).
    pub fn add_block(&self, index: usize, src: &str, dst: &str, warnings: Vec<String>) {
        let block = CacheBlock {
            index,
            src: src.to_string(),
            dst: dst.to_string(),
            status: "processed".to_string(),
            warnings,
            cot: String::new(),
            retry_history: Vec::new(),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(&pos) = state.index_map.get(&index) {
            state.blocks[pos] = block;
        } else {
            state.blocks.push(block);
            let pos = state.blocks.len() - 1;
            state.index_map.insert(index, pos);
        }
    }

    pub fn get_block(&self, index: usize) -> Option<CacheBlock> {
        let state = self.state.lock().unwrap();
        state
            .index_map
            .get(&index)
            .map(|&pos| state.blocks[pos].clone())
    }

    pub fn update_block(
        &self,
        index: usize,
        dst: Option<&str>,
        status: Option<&str>,
        warnings: Option<Vec<String>>,
    ) -> bool {
        let mut state = self.state.lock().unwrap();
        let Some(&pos) = state.index_map.get(&index) else {
            return false;
        };
        let block = &mut state.blocks[pos];
        if let Some(dst) = dst {
            block.dst = dst.to_string();
            block.status = "edited".to_string();
        }
        if let Some(status) = status {
            block.status = status.to_string();
        }
        if let Some(warnings) = warnings {
            block.warnings = warnings;
        }
        true
    }

    pub fn block_count(&self) -> usize {
        self.state.lock().unwrap().blocks.len()
    }

    pub fn blocks(&self) -> Vec<CacheBlock> {
        self.state.lock().unwrap().blocks.clone()
    }

    /// Persist to disk.  The JSON document is rendered under the lock; file
    /// I/O happens outside it so writers do not stall other workers.
    pub fn save(&self, meta: &CacheMeta) -> bool {
        let data = {
            let state = self.state.lock().unwrap();
            let blocks = &state.blocks;
            let mut data = json!({
                "version": "2.0",
                "outputPath": self.output_path,
                "sourcePath": state.source_path,
                "modelName": meta.model_name,
                "glossaryPath": meta.glossary_path,
                "stats": {
                    "concurrency": meta.concurrency,
                    "blockCount": blocks.len(),
                    "srcLines": blocks.iter().map(|b| b.src_lines()).sum::<usize>(),
                    "dstLines": blocks.iter().map(|b| b.dst_lines()).sum::<usize>(),
                    "srcChars": blocks.iter().map(|b| b.src_chars()).sum::<usize>(),
                    "dstChars": blocks.iter().map(|b| b.dst_chars()).sum::<usize>(),
                },
                "blocks": blocks.iter().map(|b| b.to_json()).collect::<Vec<_>>(),
            });

            let engine_mode = meta.engine_mode.trim().to_ascii_lowercase();
            if matches!(engine_mode.as_str(), "v1" | "v2") {
                data["engineMode"] = json!(engine_mode);
            }
            let mut chunk_type = meta.chunk_type.trim().to_ascii_lowercase();
            if chunk_type == "legacy" {
                chunk_type = "block".to_string();
            }
            if matches!(chunk_type.as_str(), "line" | "chunk" | "block") {
                data["chunkType"] = json!(chunk_type);
            }
            let pipeline_id = meta.pipeline_id.trim();
            if !pipeline_id.is_empty() {
                data["pipelineId"] = json!(pipeline_id);
            }
            data
        };

        let rendered = match serde_json::to_string_pretty(&data) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "cache serialization failed");
                return false;
            }
        };
        if let Err(e) = std::fs::write(&self.cache_path, rendered) {
            warn!(path = %self.cache_path.display(), error = %e, "cache save failed");
            return false;
        }
        true
    }

    /// Load from disk.  The new state is built off-lock and swapped in
    /// atomically; a failed load leaves existing state untouched.
    pub fn load(&self) -> bool {
        if !self.cache_path.exists() {
            return false;
        }
        let content = match std::fs::read_to_string(&self.cache_path) {
            Ok(c) => c,
            Err(e) => {
                warn!(path = %self.cache_path.display(), error = %e, "cache load failed");
                return false;
            }
        };
        let data: serde_json::Value = match serde_json::from_str(&content) {
            Ok(d) => d,
            Err(e) => {
                warn!(path = %self.cache_path.display(), error = %e, "cache load failed");
                return false;
            }
        };

        let new_source_path = data["sourcePath"].as_str().unwrap_or_default().to_string();
        let new_blocks: Vec<CacheBlock> = data["blocks"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| serde_json::from_value(b.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();
        let new_index_map: HashMap<usize, usize> = new_blocks
            .iter()
            .enumerate()
            .map(|(pos, b)| (b.index, pos))
            .collect();

        let mut state = self.state.lock().unwrap();
        state.source_path = new_source_path;
        state.blocks = new_blocks;
        state.index_map = new_index_map;
        true
    }

    /// Concatenate `dst` strings in index order, newline-separated (newlines
    /// inside a dst are preserved).
    pub fn export_to_text(&self) -> String {
        let state = self.state.lock().unwrap();
        let mut sorted: Vec<&CacheBlock> = state.blocks.iter().collect();
        sorted.sort_by_key(|b| b.index);
        sorted
            .iter()
            .map(|b| b.dst.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn stats(&self) -> serde_json::Value {
        let state = self.state.lock().unwrap();
        let blocks = &state.blocks;
        json!({
            "blockCount": blocks.len(),
            "srcLines": blocks.iter().map(|b| b.src_lines()).sum::<usize>(),
            "dstLines": blocks.iter().map(|b| b.dst_lines()).sum::<usize>(),
            "srcChars": blocks.iter().map(|b| b.src_chars()).sum::<usize>(),
            "dstChars": blocks.iter().map(|b| b.dst_chars()).sum::<usize>(),
            "withWarnings": blocks.iter().filter(|b| !b.warnings.is_empty()).count(),
            "edited": blocks.iter().filter(|b| b.status == "edited").count(),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
