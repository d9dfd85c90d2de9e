// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Resume protocol: the temp-progress file and its fingerprint.
//!
//! The temp-progress file is an append-only JSONL log next to the output:
//! first line a fingerprint identifying the run, then one `{type:"block",
//! index, src, dst}` entry per completed block.  Readers tolerate trailing
//! partial lines (a crash mid-write must not poison the resume).  A
//! fingerprint mismatch discards the file entirely.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::json;
use tracing::debug;

use hibiki_cache::TranslationCache;

/// Identity of a resumable run.  Empty fields are not compared, so older
/// fingerprints missing a field still match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprint {
    pub input: String,
    pub pipeline: String,
    pub chunk_type: String,
}

impl Fingerprint {
    fn to_json(&self) -> serde_json::Value {
        json!({
            "type": "fingerprint",
            "version": 1,
            "input": self.input,
            "pipeline": self.pipeline,
            "chunk_type": self.chunk_type,
        })
    }

    fn matches(&self, header: &serde_json::Value) -> bool {
        for (key, value) in [
            ("input", &self.input),
            ("pipeline", &self.pipeline),
            ("chunk_type", &self.chunk_type),
        ] {
            if value.is_empty() {
                continue;
            }
            if header.get(key).and_then(|v| v.as_str()) != Some(value.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResumeEntry {
    pub src: String,
    pub dst: String,
}

/// Parse a temp-progress file.  Returns the recovered entries and whether the
/// file's fingerprint matched (`matched == false` means a fresh fingerprint
/// must be written).
pub fn load_resume_file(
    path: &Path,
    expected: &Fingerprint,
) -> (HashMap<usize, ResumeEntry>, bool) {
    let mut entries = HashMap::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return (entries, false);
    };
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    if lines.is_empty() {
        return (entries, false);
    }

    let mut matched = false;
    let mut start_idx = 0;
    if let Ok(header) = serde_json::from_str::<serde_json::Value>(lines[0]) {
        if header.get("type").and_then(|v| v.as_str()) == Some("fingerprint") {
            start_idx = 1;
            matched = true;
            if !expected.matches(&header) {
                debug!(path = %path.display(), "temp-progress fingerprint mismatch; discarding");
                return (HashMap::new(), false);
            }
        }
    }

    for raw in &lines[start_idx..] {
        // Trailing partial lines (crash mid-write) simply fail to parse.
        let Ok(data) = serde_json::from_str::<serde_json::Value>(raw) else {
            continue;
        };
        if !data.is_object() {
            continue;
        }
        let index = ["index", "block_idx", "block"]
            .iter()
            .find_map(|k| data.get(*k))
            .and_then(|v| v.as_u64());
        let Some(index) = index else { continue };
        let dst = ["dst", "output", "preview_text", "out_text"]
            .iter()
            .find_map(|k| data.get(*k))
            .and_then(|v| v.as_str());
        let Some(dst) = dst else { continue };
        let src = ["src", "src_text"]
            .iter()
            .find_map(|k| data.get(*k))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        entries.insert(
            index as usize,
            ResumeEntry {
                src: src.to_string(),
                dst: dst.to_string(),
            },
        );
    }

    // A headerless file that still produced entries is treated as matched
    // (pre-fingerprint format).
    if !entries.is_empty() && start_idx == 0 {
        matched = true;
    }
    (entries, matched)
}

/// Secondary resume source: the prior translation cache.  Entries populate
/// the resume set, but the temp file is *not* considered matched; a fresh
/// fingerprint gets written.
pub fn load_resume_cache(
    output_path: &str,
    cache_dir: Option<&Path>,
) -> HashMap<usize, ResumeEntry> {
    let cache = TranslationCache::new(output_path, cache_dir.filter(|d| d.is_dir()), "");
    if !cache.load() {
        return HashMap::new();
    }
    cache
        .blocks()
        .into_iter()
        .map(|block| {
            (
                block.index,
                ResumeEntry {
                    src: block.src,
                    dst: block.dst,
                },
            )
        })
        .collect()
}

/// Append-only, line-buffered temp-progress writer shared by all workers.
pub struct TempProgress {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl TempProgress {
    /// Open in `"a"` when resuming a matched file, `"w"` otherwise (writing a
    /// fresh fingerprint as the first line).
    pub fn open(path: &Path, append: bool, fingerprint: &Fingerprint) -> std::io::Result<Self> {
        let mut options = std::fs::OpenOptions::new();
        if append {
            options.append(true).create(true);
        } else {
            options.write(true).create(true).truncate(true);
        }
        let mut file = options.open(path)?;
        if !append {
            writeln!(file, "{}", fingerprint.to_json())?;
            file.flush()?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_entry(&self, index: usize, src: &str, dst: &str) {
        let payload = json!({
            "type": "block",
            "index": index,
            "src": src,
            "dst": dst,
        });
        let mut file = self.file.lock().unwrap();
        let _ = writeln!(file, "{payload}");
        let _ = file.flush();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            input: "in.txt".into(),
            pipeline: "pipe".into(),
            chunk_type: "line".into(),
        }
    }

    #[test]
    fn write_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.temp.jsonl");
        let temp = TempProgress::open(&path, false, &fingerprint()).unwrap();
        temp.write_entry(0, "hello", "你好");
        temp.write_entry(1, "world", "世界");
        drop(temp);

        let (entries, matched) = load_resume_file(&path, &fingerprint());
        assert!(matched);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[&0].dst, "你好");
        assert_eq!(entries[&1].src, "world");
    }

    #[test]
    fn fingerprint_mismatch_discards_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.temp.jsonl");
        let temp = TempProgress::open(&path, false, &fingerprint()).unwrap();
        temp.write_entry(0, "a", "b");
        drop(temp);

        let other = Fingerprint {
            pipeline: "different".into(),
            ..fingerprint()
        };
        let (entries, matched) = load_resume_file(&path, &other);
        assert!(!matched);
        assert!(entries.is_empty());
    }

    #[test]
    fn empty_expected_fields_are_not_compared() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.temp.jsonl");
        let temp = TempProgress::open(&path, false, &fingerprint()).unwrap();
        temp.write_entry(0, "a", "b");
        drop(temp);

        let relaxed = Fingerprint {
            input: String::new(),
            pipeline: "pipe".into(),
            chunk_type: String::new(),
        };
        let (entries, matched) = load_resume_file(&path, &relaxed);
        assert!(matched);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn trailing_partial_line_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.temp.jsonl");
        let temp = TempProgress::open(&path, false, &fingerprint()).unwrap();
        temp.write_entry(0, "a", "b");
        drop(temp);
        // Simulate a crash mid-write.
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(file, "{{\"type\": \"block\", \"index\": 1, \"src").unwrap();
        drop(file);

        let (entries, matched) = load_resume_file(&path, &fingerprint());
        assert!(matched);
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn legacy_entry_keys_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.jsonl");
        std::fs::write(
            &path,
            "{\"block_idx\": 2, \"output\": \"legacy dst\", \"src_text\": \"legacy src\"}\n",
        )
        .unwrap();
        let (entries, matched) = load_resume_file(&path, &Fingerprint::default());
        assert!(matched, "headerless file with entries counts as matched");
        assert_eq!(entries[&2].dst, "legacy dst");
        assert_eq!(entries[&2].src, "legacy src");
    }

    #[test]
    fn append_mode_preserves_existing_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.temp.jsonl");
        let temp = TempProgress::open(&path, false, &fingerprint()).unwrap();
        temp.write_entry(0, "a", "b");
        drop(temp);

        let temp = TempProgress::open(&path, true, &fingerprint()).unwrap();
        temp.write_entry(1, "c", "d");
        drop(temp);

        let (entries, matched) = load_resume_file(&path, &fingerprint());
        assert!(matched);
        assert_eq!(entries.len(), 2);
    }

    #[test]
    fn missing_file_is_unmatched() {
        let (entries, matched) =
            load_resume_file(Path::new("/no/such/file.jsonl"), &fingerprint());
        assert!(entries.is_empty());
        assert!(!matched);
    }

    #[test]
    fn resume_cache_populates_entries() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.txt");
        let output = output.to_str().unwrap();
        let cache = TranslationCache::new(output, None, "in.txt");
        cache.add_block(0, "hello", "你好", Vec::new());
        cache.save(&hibiki_cache::CacheMeta::default());

        let entries = load_resume_cache(output, None);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[&0].dst, "你好");

        assert!(load_resume_cache(dir.path().join("missing.txt").to_str().unwrap(), None)
            .is_empty());
    }
}
