// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The pipeline runner: chunk → translate → retry → parse → line-policy →
//! ordered output, with resume, caching, and adaptive concurrency.

mod adaptive;
mod resume;
mod runner;

pub use adaptive::{classify_error, AdaptiveConcurrency, AdaptiveConfig, ErrorKind};
pub use resume::{load_resume_cache, load_resume_file, Fingerprint, ResumeEntry, TempProgress};
pub use runner::{PipelineRunner, RunError, RunOptions};
