// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Source document model: ordered items in, translated blocks out.
//!
//! A document decoder turns a file into a sequence of [`Item`]s (text plus an
//! opaque `meta` handle) and later reinserts translated [`TextBlock`]s into
//! the same structural positions.  The pipeline never inspects `meta`; it only
//! guarantees that the metadata union of the blocks it hands back covers
//! exactly the items it was given, in order.
//!
//! Only the plain-text decoder ships in-core.  Structured decoders (EPUB and
//! friends) are collaborators behind the [`Document`] trait; the factory still
//! recognises their extensions so callers can branch on [`DocumentKind`]
//! (subtitle inputs force `keep_empty` in line chunking, for example).

use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("no decoder registered for {0:?} documents")]
    UnsupportedFormat(DocumentKind),
}

/// Opaque per-item handle a decoder uses to reinsert translated text.
///
/// Plain text uses the zero-based line index; structured decoders carry a
/// decoder-private token instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemMeta {
    Line(usize),
    Token(String),
}

impl ItemMeta {
    /// Line index when this meta came from a line-oriented decoder.
    pub fn line_index(&self) -> Option<usize> {
        match self {
            ItemMeta::Line(idx) => Some(*idx),
            ItemMeta::Token(_) => None,
        }
    }
}

/// One logical unit of source text as produced by a decoder.
#[derive(Debug, Clone)]
pub struct Item {
    pub text: String,
    pub meta: ItemMeta,
}

/// A translation unit: one or more items merged by a chunk policy.
///
/// `metadata` lists the item metas that composed this block, in order.  The
/// concatenation of block metadata across blocks reproduces the original item
/// sequence.
#[derive(Debug, Clone)]
pub struct TextBlock {
    pub id: usize,
    pub prompt_text: String,
    pub metadata: Vec<ItemMeta>,
}

impl TextBlock {
    pub fn new(id: usize, prompt_text: impl Into<String>, metadata: Vec<ItemMeta>) -> Self {
        Self {
            id,
            prompt_text: prompt_text.into(),
            metadata,
        }
    }

    /// `(first_line, last_line + 1)` covered by this block's line metadata.
    pub fn line_range(&self) -> (usize, usize) {
        let mut min: Option<usize> = None;
        let mut max: Option<usize> = None;
        for meta in &self.metadata {
            if let Some(idx) = meta.line_index() {
                min = Some(min.map_or(idx, |m: usize| m.min(idx)));
                max = Some(max.map_or(idx, |m: usize| m.max(idx)));
            }
        }
        match (min, max) {
            (Some(lo), Some(hi)) => (lo, hi + 1),
            _ => (0, 0),
        }
    }
}

/// Structural family of a source document, derived from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Text,
    Subtitle,
    Epub,
}

/// A document decoder/encoder pair.
///
/// `save` must produce a file of the same structural shape as the input when
/// given blocks whose metadata union covers exactly the items from `load`.
pub trait Document: Send {
    fn kind(&self) -> DocumentKind;
    fn path(&self) -> &Path;
    fn load(&self) -> Result<Vec<Item>, DocumentError>;
    fn save(&self, path: &Path, blocks: &[TextBlock]) -> Result<(), DocumentError>;
}

/// Select a decoder by file extension.  Plain text is the fallback for
/// unknown extensions.  Subtitle files decode line-by-line in-core (the shape
/// of an SRT/ASS file is preserved by 1:1 line replacement); EPUB requires an
/// external decoder.
pub fn open_document(path: &Path) -> Result<Box<dyn Document>, DocumentError> {
    let kind = kind_for_path(path);
    match kind {
        DocumentKind::Epub => Err(DocumentError::UnsupportedFormat(kind)),
        DocumentKind::Text | DocumentKind::Subtitle => {
            Ok(Box::new(TxtDocument::new(path.to_path_buf(), kind)))
        }
    }
}

fn kind_for_path(path: &Path) -> DocumentKind {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "srt" | "ass" | "ssa" => DocumentKind::Subtitle,
        "epub" => DocumentKind::Epub,
        _ => DocumentKind::Text,
    }
}

/// Line-oriented decoder: one item per source line, newline kept on the item
/// text so block chunking can concatenate without re-inserting separators.
pub struct TxtDocument {
    path: PathBuf,
    kind: DocumentKind,
}

impl TxtDocument {
    pub fn new(path: PathBuf, kind: DocumentKind) -> Self {
        Self { path, kind }
    }
}

impl Document for TxtDocument {
    fn kind(&self) -> DocumentKind {
        self.kind
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<Vec<Item>, DocumentError> {
        let content = std::fs::read_to_string(&self.path).map_err(|source| {
            DocumentError::Read {
                path: self.path.clone(),
                source,
            }
        })?;
        let items = content
            .split_inclusive('\n')
            .enumerate()
            .map(|(idx, line)| Item {
                text: line.to_string(),
                meta: ItemMeta::Line(idx),
            })
            .collect();
        Ok(items)
    }

    fn save(&self, path: &Path, blocks: &[TextBlock]) -> Result<(), DocumentError> {
        let mut out = blocks
            .iter()
            .map(|b| b.prompt_text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        std::fs::write(path, out).map_err(|source| DocumentError::Write {
            path: path.to_path_buf(),
            source,
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn kind_detection_by_extension() {
        assert_eq!(kind_for_path(Path::new("a.txt")), DocumentKind::Text);
        assert_eq!(kind_for_path(Path::new("a.SRT")), DocumentKind::Subtitle);
        assert_eq!(kind_for_path(Path::new("a.ass")), DocumentKind::Subtitle);
        assert_eq!(kind_for_path(Path::new("a.epub")), DocumentKind::Epub);
        assert_eq!(kind_for_path(Path::new("noext")), DocumentKind::Text);
    }

    #[test]
    fn epub_requires_external_decoder() {
        let err = open_document(Path::new("book.epub")).err().unwrap();
        assert!(matches!(err, DocumentError::UnsupportedFormat(DocumentKind::Epub)));
    }

    #[test]
    fn txt_load_keeps_newlines_and_line_meta() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "hello\nworld\n").unwrap();
        let doc = TxtDocument::new(f.path().to_path_buf(), DocumentKind::Text);
        let items = doc.load().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].text, "hello\n");
        assert_eq!(items[1].text, "world\n");
        assert_eq!(items[0].meta, ItemMeta::Line(0));
        assert_eq!(items[1].meta, ItemMeta::Line(1));
    }

    #[test]
    fn txt_load_keeps_final_unterminated_line() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "a\nb").unwrap();
        let doc = TxtDocument::new(f.path().to_path_buf(), DocumentKind::Text);
        let items = doc.load().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1].text, "b");
    }

    #[test]
    fn txt_save_joins_blocks_with_newline() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.txt");
        let doc = TxtDocument::new(out.clone(), DocumentKind::Text);
        let blocks = vec![
            TextBlock::new(1, "你好", vec![ItemMeta::Line(0)]),
            TextBlock::new(2, "世界", vec![ItemMeta::Line(1)]),
        ];
        doc.save(&out, &blocks).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "你好\n世界\n");
    }

    #[test]
    fn txt_round_trip_preserves_shape() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "one\n\nthree\n").unwrap();
        let doc = TxtDocument::new(f.path().to_path_buf(), DocumentKind::Text);
        let items = doc.load().unwrap();
        let blocks: Vec<TextBlock> = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                TextBlock::new(i + 1, item.text.trim_end_matches('\n'), vec![item.meta.clone()])
            })
            .collect();
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("rt.txt");
        doc.save(&out, &blocks).unwrap();
        assert_eq!(std::fs::read_to_string(&out).unwrap(), "one\n\nthree\n");
    }

    #[test]
    fn block_line_range_spans_metadata() {
        let b = TextBlock::new(
            1,
            "x",
            vec![ItemMeta::Line(3), ItemMeta::Line(5), ItemMeta::Line(4)],
        );
        assert_eq!(b.line_range(), (3, 6));
        let no_lines = TextBlock::new(2, "y", vec![ItemMeta::Token("n1".into())]);
        assert_eq!(no_lines.line_range(), (0, 0));
    }
}
