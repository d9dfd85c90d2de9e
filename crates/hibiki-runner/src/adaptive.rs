// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Adaptive concurrency controller.
//!
//! Bounds dispatch parallelism by observed error pressure.  Rate-limit
//! errors halve the limit immediately; server/network errors accumulate and
//! shave one slot once they reach a tolerated fraction of the current limit;
//! successes grow the limit back: one per success during warm-up, then one
//! per `success_target` streak.

use std::sync::{Mutex, OnceLock};

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RateLimited,
    ServerError,
    Network,
    Other,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Network => "network",
            ErrorKind::Other => "other",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// Classify a provider error message.
pub fn classify_error(message: Option<&str>) -> ErrorKind {
    static RATE: OnceLock<Regex> = OnceLock::new();
    static SERVER: OnceLock<Regex> = OnceLock::new();
    static NETWORK: OnceLock<Regex> = OnceLock::new();

    let Some(message) = message.filter(|m| !m.is_empty()) else {
        return ErrorKind::Unknown;
    };
    let rate = RATE.get_or_init(|| Regex::new(r"(?i)\b429\b|rate\s*limit|rate_limited").unwrap());
    let server = SERVER.get_or_init(|| Regex::new(r"\b5\d{2}\b").unwrap());
    let network =
        NETWORK.get_or_init(|| Regex::new(r"(?i)timeout|timed\s*out|network").unwrap());

    if rate.is_match(message) {
        ErrorKind::RateLimited
    } else if server.is_match(message) || message.contains("5xx") {
        ErrorKind::ServerError
    } else if network.is_match(message) {
        ErrorKind::Network
    } else {
        ErrorKind::Other
    }
}

#[derive(Debug, Clone)]
pub struct AdaptiveConfig {
    pub min_limit: usize,
    pub max_limit: usize,
    /// Successes in a row needed for one +1 step after warm-up.
    pub success_target: usize,
    pub start_limit: Option<usize>,
    /// During the first N successes every success grows the limit.
    pub warmup_successes: usize,
    /// Tolerated consecutive server/network errors as a fraction of the
    /// current limit before one slot is shaved.
    pub error_tolerance_ratio: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            min_limit: 1,
            max_limit: 16,
            success_target: 2,
            start_limit: None,
            warmup_successes: 10,
            error_tolerance_ratio: 0.2,
        }
    }
}

struct AdaptiveState {
    current: usize,
    success_streak: usize,
    success_total: usize,
    consecutive_errors: usize,
}

pub struct AdaptiveConcurrency {
    config: AdaptiveConfig,
    state: Mutex<AdaptiveState>,
}

impl AdaptiveConcurrency {
    pub fn new(mut config: AdaptiveConfig) -> Self {
        config.min_limit = config.min_limit.max(1);
        config.max_limit = config.max_limit.max(config.min_limit);
        let current = match config.start_limit {
            None => config.min_limit.max(config.max_limit.div_ceil(2)),
            Some(start) => start.clamp(config.min_limit, config.max_limit),
        };
        Self {
            config,
            state: Mutex::new(AdaptiveState {
                current,
                success_streak: 0,
                success_total: 0,
                consecutive_errors: 0,
            }),
        }
    }

    pub fn with_max_limit(max_limit: usize) -> Self {
        Self::new(AdaptiveConfig {
            max_limit,
            ..Default::default()
        })
    }

    pub fn max_limit(&self) -> usize {
        self.config.max_limit
    }

    pub fn get_limit(&self) -> usize {
        self.state.lock().unwrap().current
    }

    pub fn note_success(&self) {
        let mut state = self.state.lock().unwrap();
        state.success_total += 1;
        // One success clears any error streak.
        state.consecutive_errors = 0;
        if state.success_total <= self.config.warmup_successes {
            if state.current < self.config.max_limit {
                state.current += 1;
            }
            state.success_streak = 0;
            return;
        }
        state.success_streak += 1;
        if state.success_streak >= self.config.success_target && state.current < self.config.max_limit
        {
            state.current += 1;
            state.success_streak = 0;
        }
    }

    /// Classify `message`, adjust the limit, and return the classification.
    pub fn note_error(&self, message: &str) -> ErrorKind {
        let kind = classify_error(Some(message));
        let mut state = self.state.lock().unwrap();
        state.success_streak = 0;

        match kind {
            ErrorKind::RateLimited => {
                state.consecutive_errors = 0;
                state.current = self.config.min_limit.max(state.current.div_ceil(2));
            }
            ErrorKind::ServerError | ErrorKind::Network => {
                state.consecutive_errors += 1;
                let tolerance = ((state.current as f64 * self.config.error_tolerance_ratio)
                    as usize)
                    .max(1);
                if state.consecutive_errors >= tolerance {
                    state.current = self.config.min_limit.max(state.current - 1);
                    // Leave headroom so continued pressure keeps stepping down
                    // instead of restarting the count from zero.
                    state.consecutive_errors = tolerance.saturating_sub(1);
                }
            }
            ErrorKind::Other | ErrorKind::Unknown => {}
        }
        kind
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_rate_limit_variants() {
        assert_eq!(classify_error(Some("HTTP 429: slow down")), ErrorKind::RateLimited);
        assert_eq!(classify_error(Some("Rate limit exceeded")), ErrorKind::RateLimited);
        assert_eq!(classify_error(Some("rate_limited")), ErrorKind::RateLimited);
    }

    #[test]
    fn classify_server_and_network() {
        assert_eq!(classify_error(Some("HTTP 503: unavailable")), ErrorKind::ServerError);
        assert_eq!(classify_error(Some("upstream 5xx")), ErrorKind::ServerError);
        assert_eq!(classify_error(Some("operation timed out")), ErrorKind::Network);
        assert_eq!(classify_error(Some("network unreachable")), ErrorKind::Network);
    }

    #[test]
    fn classify_fallthrough() {
        assert_eq!(classify_error(Some("HTTP 404: not found")), ErrorKind::Other);
        assert_eq!(classify_error(None), ErrorKind::Unknown);
        assert_eq!(classify_error(Some("")), ErrorKind::Unknown);
    }

    #[test]
    fn initial_limit_is_half_of_max() {
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        assert_eq!(adaptive.get_limit(), 4);
        let odd = AdaptiveConcurrency::with_max_limit(9);
        assert_eq!(odd.get_limit(), 5);
    }

    #[test]
    fn explicit_start_limit_is_clamped() {
        let adaptive = AdaptiveConcurrency::new(AdaptiveConfig {
            max_limit: 8,
            start_limit: Some(100),
            ..Default::default()
        });
        assert_eq!(adaptive.get_limit(), 8);
    }

    #[test]
    fn warmup_grows_on_every_success() {
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        adaptive.note_success();
        adaptive.note_success();
        assert_eq!(adaptive.get_limit(), 6);
    }

    #[test]
    fn limit_never_exceeds_max() {
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        for _ in 0..50 {
            adaptive.note_success();
        }
        assert_eq!(adaptive.get_limit(), 8);
    }

    #[test]
    fn steady_phase_needs_success_streak() {
        let adaptive = AdaptiveConcurrency::new(AdaptiveConfig {
            max_limit: 32,
            warmup_successes: 0,
            success_target: 2,
            ..Default::default()
        });
        let start = adaptive.get_limit();
        adaptive.note_success();
        assert_eq!(adaptive.get_limit(), start);
        adaptive.note_success();
        assert_eq!(adaptive.get_limit(), start + 1);
    }

    #[test]
    fn rate_limit_halves_with_floor() {
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        // 15 successes drive the limit to max (warm-up 10, then streaks).
        for _ in 0..15 {
            adaptive.note_success();
        }
        assert_eq!(adaptive.get_limit(), 8);
        assert_eq!(adaptive.note_error("HTTP 429"), ErrorKind::RateLimited);
        assert_eq!(adaptive.get_limit(), 4);

        for _ in 0..5 {
            adaptive.note_error("429 again");
        }
        assert_eq!(adaptive.get_limit(), 1, "floor is min_limit");
    }

    #[test]
    fn server_errors_step_down_after_tolerance() {
        let adaptive = AdaptiveConcurrency::new(AdaptiveConfig {
            max_limit: 16,
            start_limit: Some(10),
            ..Default::default()
        });
        // tolerance = ceil-ish floor(10 × 0.2) = 2: first error tolerated.
        adaptive.note_error("HTTP 502");
        assert_eq!(adaptive.get_limit(), 10);
        adaptive.note_error("HTTP 502");
        assert_eq!(adaptive.get_limit(), 9);
        // Headroom: one more error continues the decline immediately.
        adaptive.note_error("HTTP 502");
        assert_eq!(adaptive.get_limit(), 8);
    }

    #[test]
    fn success_clears_consecutive_errors() {
        let adaptive = AdaptiveConcurrency::new(AdaptiveConfig {
            max_limit: 16,
            start_limit: Some(10),
            warmup_successes: 0,
            ..Default::default()
        });
        adaptive.note_error("HTTP 502");
        adaptive.note_success();
        adaptive.note_error("HTTP 502");
        // The counter restarted, so the tolerance of 2 is not yet reached.
        assert_eq!(adaptive.get_limit(), 10);
    }

    #[test]
    fn other_errors_do_not_move_the_limit() {
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        let before = adaptive.get_limit();
        assert_eq!(adaptive.note_error("HTTP 404: nope"), ErrorKind::Other);
        assert_eq!(adaptive.get_limit(), before);
    }

    #[test]
    fn adaptive_limit_sequence_scenario() {
        // 15 successes then one HTTP 429 ends at ceil(8/2) = 4.
        let adaptive = AdaptiveConcurrency::with_max_limit(8);
        for _ in 0..15 {
            adaptive.note_success();
        }
        adaptive.note_error("HTTP 429");
        assert_eq!(adaptive.get_limit(), 4);
    }
}
