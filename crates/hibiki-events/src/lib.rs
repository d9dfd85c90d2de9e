// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Structured JSON event protocol on stdout.
//!
//! Each event is one `<PREFIX>:<json>` line the supervising host parses.
//! Stdout belongs to this protocol exclusively; human diagnostics go to
//! stderr via `tracing`.  Events flow through a single writer thread behind a
//! bounded channel, so emission never interleaves and a stalled consumer
//! applies backpressure instead of unbounded buffering.

mod tracker;

pub use tracker::ProgressTracker;

use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::OnceLock;

use serde_json::json;

const EVENT_QUEUE_DEPTH: usize = 256;

enum WriterMessage {
    Line(String),
    /// Rendezvous: acknowledged once every earlier line hit stdout.
    Flush(SyncSender<()>),
}

fn writer() -> &'static SyncSender<WriterMessage> {
    static WRITER: OnceLock<SyncSender<WriterMessage>> = OnceLock::new();
    WRITER.get_or_init(|| {
        let (tx, rx) = sync_channel::<WriterMessage>(EVENT_QUEUE_DEPTH);
        std::thread::Builder::new()
            .name("event-writer".into())
            .spawn(move || {
                use std::io::Write;
                let stdout = std::io::stdout();
                for message in rx {
                    match message {
                        WriterMessage::Line(line) => {
                            let mut lock = stdout.lock();
                            let _ = writeln!(lock, "{line}");
                            let _ = lock.flush();
                        }
                        WriterMessage::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .expect("failed to spawn event writer thread");
        tx
    })
}

/// Emit one protocol line.  Order is preserved per process (single queue,
/// single writer).
pub fn emit(prefix: &str, data: &serde_json::Value) {
    let line = format!("{prefix}:{data}");
    // A send error means the writer thread is gone (process teardown); the
    // event is droppable at that point.
    let _ = writer().send(WriterMessage::Line(line));
}

/// Block until every event emitted so far has reached stdout.  Call before
/// process exit; queued events would otherwise race the teardown.
pub fn flush() {
    let (ack_tx, ack_rx) = sync_channel::<()>(0);
    if writer().send(WriterMessage::Flush(ack_tx)).is_ok() {
        let _ = ack_rx.recv();
    }
}

pub fn emit_preview_block(block: usize, src: &str, output: &str) {
    const MAX_PREVIEW: usize = 2000;
    let clip = |s: &str| -> String {
        if s.chars().count() > MAX_PREVIEW {
            s.chars().take(MAX_PREVIEW).collect()
        } else {
            s.to_string()
        }
    };
    emit(
        "JSON_PREVIEW_BLOCK",
        &json!({
            "block": block,
            "src": clip(src),
            "output": clip(output),
        }),
    );
}

pub fn emit_output_path(path: &str) {
    emit("JSON_OUTPUT_PATH", &json!({ "path": path }));
}

pub fn emit_cache_path(path: &str) {
    emit("JSON_CACHE_PATH", &json!({ "path": path }));
}

/// `error_type` ∈ `empty | line_mismatch | provider_error | repetition`.
pub fn emit_retry(block: usize, attempt: u32, error_type: &str) {
    emit(
        "JSON_RETRY",
        &json!({
            "block": block,
            "attempt": attempt,
            "type": error_type,
        }),
    );
}

pub fn emit_warning(block: usize, message: &str, warn_type: &str) {
    emit(
        "JSON_WARNING",
        &json!({
            "block": block,
            "type": warn_type,
            "message": message,
        }),
    );
}

pub fn emit_error(title: &str, message: &str) {
    emit(
        "JSON_ERROR",
        &json!({
            "title": title,
            "message": message,
        }),
    );
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
