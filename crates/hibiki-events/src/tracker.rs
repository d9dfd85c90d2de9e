// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Run progress accumulation and throttled `JSON_PROGRESS` emission.
//!
//! One tracker per run, shared by all workers.  Counters live behind a single
//! mutex; snapshots are throttled to 200 ms except forced flushes on block
//! completion and at end of run.  Realtime speeds come from a 5 s sliding
//! sample window; API RPM from a rolling 60 s request-timestamp window.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::{emit, emit_preview_block};

const MIN_EMIT_INTERVAL: Duration = Duration::from_millis(200);
const SPEED_WINDOW: Duration = Duration::from_secs(5);
const REQUEST_WINDOW: Duration = Duration::from_secs(60);

#[derive(Default)]
struct Counters {
    completed_blocks: usize,
    total_output_lines: u64,
    total_output_chars: u64,
    total_requests: u64,
    total_retries: u64,
    total_errors: u64,
    total_input_tokens: u64,
    total_output_tokens: u64,
    error_status_codes: HashMap<u16, u64>,
    last_ping: Option<u64>,
    current_concurrency: usize,
    api_url: Option<String>,
}

struct State {
    counters: Counters,
    last_emit_at: Option<Instant>,
    speed_samples: VecDeque<(Instant, u64, u64, u64, u64)>,
    request_timestamps: VecDeque<Instant>,
}

pub struct ProgressTracker {
    total_blocks: usize,
    total_source_lines: usize,
    total_source_chars: u64,
    start_time: Instant,
    state: Mutex<State>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

impl ProgressTracker {
    pub fn new(total_blocks: usize, total_source_lines: usize, total_source_chars: u64) -> Self {
        Self {
            total_blocks,
            total_source_lines,
            total_source_chars,
            start_time: Instant::now(),
            state: Mutex::new(State {
                counters: Counters {
                    current_concurrency: 1,
                    ..Default::default()
                },
                last_emit_at: None,
                speed_samples: VecDeque::new(),
                request_timestamps: VecDeque::new(),
            }),
        }
    }

    pub fn set_concurrency(&self, concurrency: usize) {
        self.state.lock().unwrap().counters.current_concurrency = concurrency;
    }

    pub fn set_api_url(&self, url: Option<String>) {
        self.state.lock().unwrap().counters.api_url = url;
    }

    /// Record a completed block and flush a forced progress snapshot plus a
    /// (truncated) preview event.
    pub fn block_done(&self, block_idx: usize, src_text: &str, output_text: &str) {
        let out_lines = if output_text.is_empty() {
            0
        } else {
            output_text.matches('\n').count() as u64 + 1
        };
        {
            let mut state = self.state.lock().unwrap();
            state.counters.completed_blocks += 1;
            state.counters.total_output_lines += out_lines;
            state.counters.total_output_chars += output_text.chars().count() as u64;
        }
        self.emit_progress_snapshot(true);
        emit_preview_block(block_idx + 1, src_text, output_text);
    }

    /// Record a successful API request with its token usage.
    pub fn note_request(&self, input_tokens: u64, output_tokens: u64) {
        let now = Instant::now();
        {
            let mut state = self.state.lock().unwrap();
            state.counters.total_requests += 1;
            state.counters.total_input_tokens += input_tokens;
            state.counters.total_output_tokens += output_tokens;
            state.request_timestamps.push_back(now);
            prune_requests(&mut state.request_timestamps, now);
        }
        self.emit_progress_snapshot(false);
    }

    pub fn note_retry(&self, status_code: Option<u16>) {
        let mut state = self.state.lock().unwrap();
        state.counters.total_retries += 1;
        if let Some(code) = status_code {
            *state.counters.error_status_codes.entry(code).or_insert(0) += 1;
        }
    }

    /// Record a block whose retries were exhausted.
    pub fn note_error(&self, status_code: Option<u16>) {
        let mut state = self.state.lock().unwrap();
        state.counters.total_errors += 1;
        if let Some(code) = status_code {
            *state.counters.error_status_codes.entry(code).or_insert(0) += 1;
        }
    }

    /// Pre-fill counters from resumed blocks and emit a baseline snapshot.
    pub fn seed_progress(&self, completed_blocks: usize, output_lines: u64, output_chars: u64) {
        {
            let mut state = self.state.lock().unwrap();
            state.counters.completed_blocks = completed_blocks.min(self.total_blocks);
            state.counters.total_output_lines = output_lines;
            state.counters.total_output_chars = output_chars;
        }
        self.emit_progress_snapshot(true);
    }

    pub fn total_errors(&self) -> u64 {
        self.state.lock().unwrap().counters.total_errors
    }

    pub fn emit_progress_snapshot(&self, force: bool) {
        let now = Instant::now();
        let payload = {
            let mut state = self.state.lock().unwrap();
            if !force {
                if let Some(last) = state.last_emit_at {
                    if now.duration_since(last) < MIN_EMIT_INTERVAL {
                        return;
                    }
                }
            }
            state.last_emit_at = Some(now);
            self.build_progress_payload(&mut state, now)
        };
        emit("JSON_PROGRESS", &payload);
    }

    fn build_progress_payload(&self, state: &mut State, now: Instant) -> serde_json::Value {
        prune_requests(&mut state.request_timestamps, now);

        let c = &state.counters;
        state.speed_samples.push_back((
            now,
            c.total_output_lines,
            c.total_output_chars,
            c.total_input_tokens,
            c.total_output_tokens,
        ));
        while state.speed_samples.len() > 2 {
            let front = state.speed_samples.front().unwrap().0;
            if now.duration_since(front) > SPEED_WINDOW {
                state.speed_samples.pop_front();
            } else {
                break;
            }
        }

        let c = &state.counters;
        let elapsed = now.duration_since(self.start_time).as_secs_f64().max(0.001);

        let mut realtime_lines = 0.0;
        let mut realtime_chars = 0.0;
        let mut realtime_eval = 0.0;
        let mut realtime_gen = 0.0;
        if state.speed_samples.len() >= 2 {
            let (t0, lines0, chars0, in0, out0) = *state.speed_samples.front().unwrap();
            let (t1, lines1, chars1, in1, out1) = *state.speed_samples.back().unwrap();
            let dt = t1.duration_since(t0).as_secs_f64().max(0.001);
            realtime_lines = (lines1.saturating_sub(lines0)) as f64 / dt;
            realtime_chars = (chars1.saturating_sub(chars0)) as f64 / dt;
            realtime_eval = (in1.saturating_sub(in0)) as f64 / dt;
            realtime_gen = (out1.saturating_sub(out0)) as f64 / dt;
        }

        let warmup_window = REQUEST_WINDOW.as_secs_f64().min(elapsed.max(1.0));
        let api_rpm = state.request_timestamps.len() as f64 * 60.0 / warmup_window;

        let current = c.completed_blocks;
        let total = self.total_blocks;
        let percent = round1(current as f64 / total.max(1) as f64 * 100.0);
        let remaining = if current > 0 {
            (elapsed / current as f64) * (total.saturating_sub(current)) as f64
        } else {
            0.0
        };

        json!({
            "current": current,
            "total": total,
            "percent": percent,
            "elapsed": round1(elapsed),
            "remaining": round1(remaining.max(0.0)),
            "speed_chars": round1(realtime_chars),
            "speed_lines": round2(realtime_lines),
            "speed_gen": round1(realtime_gen),
            "speed_eval": round1(realtime_eval),
            "total_lines": c.total_output_lines,
            "total_chars": c.total_output_chars,
            "source_lines": self.total_source_lines,
            "source_chars": self.total_source_chars,
            "api_ping": c.last_ping,
            "api_concurrency": c.current_concurrency,
            "api_url": c.api_url,
            "realtime_speed_chars": round1(realtime_chars),
            "realtime_speed_lines": round2(realtime_lines),
            "realtime_speed_gen": round1(realtime_gen),
            "realtime_speed_eval": round1(realtime_eval),
            "realtime_speed_tokens": round1(realtime_gen + realtime_eval),
            "api_rpm": round2(api_rpm),
            "total_requests": c.total_requests,
            "total_input_tokens": c.total_input_tokens,
            "total_output_tokens": c.total_output_tokens,
        })
    }

    /// Final `JSON_FINAL` summary with accumulated statistics.
    pub fn emit_final_stats(&self) {
        let state = self.state.lock().unwrap();
        let c = &state.counters;
        let elapsed = self.start_time.elapsed().as_secs_f64();
        let avg_speed = c.total_output_chars as f64 / elapsed.max(0.1);

        let mut data = json!({
            "totalTime": round1(elapsed),
            "avgSpeed": round1(avg_speed),
            "sourceLines": self.total_source_lines,
            "sourceChars": self.total_source_chars,
            "outputLines": c.total_output_lines,
            "outputChars": c.total_output_chars,
            "totalRequests": c.total_requests,
            "totalRetries": c.total_retries,
            "totalErrors": c.total_errors,
            "totalInputTokens": c.total_input_tokens,
            "totalOutputTokens": c.total_output_tokens,
        });
        if !c.error_status_codes.is_empty() {
            let codes: serde_json::Map<String, serde_json::Value> = c
                .error_status_codes
                .iter()
                .map(|(code, count)| (code.to_string(), json!(count)))
                .collect();
            data["errorStatusCodes"] = serde_json::Value::Object(codes);
        }
        emit("JSON_FINAL", &data);
    }
}

fn prune_requests(timestamps: &mut VecDeque<Instant>, now: Instant) {
    while let Some(front) = timestamps.front() {
        if now.duration_since(*front) > REQUEST_WINDOW {
            timestamps.pop_front();
        } else {
            break;
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
