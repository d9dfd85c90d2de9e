// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Pipeline orchestration.
//!
//! One [`PipelineRunner`] owns a run: it resolves the referenced profiles,
//! loads and chunks the document, dispatches per-block workers (fixed pool or
//! adaptive), and reassembles ordered output.  Worker failures are absorbed
//! into retry state; after retries are exhausted a block falls back to its
//! source text and the run completes best-effort.  Only orchestration-level
//! invariants (missing profile, unreadable input, an unfilled output slot)
//! escape to the caller.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde_json::json;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use hibiki_cache::{CacheMeta, TranslationCache};
use hibiki_document::{open_document, DocumentKind, ItemMeta, TextBlock};
use hibiki_events::{emit_retry, emit_warning, ProgressTracker};
use hibiki_parser::{lineformat, Parser, ParserError};
use hibiki_policy::{ChunkPolicy, LinePolicy, LinePolicyError};
use hibiki_process::{
    load_glossary, load_glossary_text, resolve_rules, Processor, ProcessingOptions,
};
use hibiki_profile::{
    lenient_i64, ApiProfile, ChunkProfile, ContextConfig, ParserProfile, PipelineProfile,
    PolicyProfile, ProfileError, ProfileStore, PromptProfile, Settings,
};
use hibiki_prompt::{build_messages, PromptInputs};
use hibiki_provider::{from_profile, Provider, ProviderError};

use crate::adaptive::AdaptiveConcurrency;
use crate::resume::{load_resume_cache, load_resume_file, Fingerprint, ResumeEntry, TempProgress};

const MAX_CONCURRENCY: i64 = 256;
const ADAPTIVE_MAX_LIMIT: usize = 128;

#[derive(Debug, Error)]
pub enum RunError {
    /// A referenced profile does not exist or failed to load.
    #[error("missing_profile: {0}")]
    MissingProfile(String),
    /// The input document cannot be read.
    #[error("input error: {0}")]
    Input(String),
    /// A profile exists but is unusable (bad type, bad pattern, …).
    #[error("configuration error: {0}")]
    Config(String),
    /// The barrier found an unfilled output slot.
    #[error("translation_incomplete")]
    Incomplete,
    #[error("runtime failure: {0}")]
    Runtime(String),
}

/// Per-run options, mostly CLI overrides layered over the pipeline profile.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub output_path: Option<PathBuf>,
    pub resume: bool,
    pub save_cache: bool,
    pub cache_dir: Option<PathBuf>,
    /// Rule overrides: a rule-profile id or a JSON rule file path.
    pub rules_pre: Option<String>,
    pub rules_post: Option<String>,
    pub glossary: Option<String>,
    pub source_lang: Option<String>,
    pub enable_quality: Option<bool>,
    pub text_protect: Option<bool>,
    pub cancel: CancellationToken,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            output_path: None,
            resume: false,
            save_cache: true,
            cache_dir: None,
            rules_pre: None,
            rules_post: None,
            glossary: None,
            source_lang: None,
            enable_quality: None,
            text_protect: None,
            cancel: CancellationToken::new(),
        }
    }
}

pub struct PipelineRunner {
    store: ProfileStore,
    pipeline: PipelineProfile,
    provider_override: Option<Arc<dyn Provider>>,
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("store", &self.store)
            .field("pipeline", &self.pipeline)
            .field("provider_override", &self.provider_override.is_some())
            .finish()
    }
}

impl PipelineRunner {
    pub fn new(store: ProfileStore, pipeline: PipelineProfile) -> Self {
        Self {
            store,
            pipeline,
            provider_override: None,
        }
    }

    /// Load the pipeline profile by reference, then construct the runner.
    pub fn load(store: ProfileStore, pipeline_ref: &str) -> Result<Self, RunError> {
        let pipeline: PipelineProfile = store
            .load("pipeline", pipeline_ref)
            .map_err(profile_error)?;
        Ok(Self::new(store, pipeline))
    }

    /// Inject a provider instead of resolving the `api` profile: the seam
    /// tests use to run against scripted mocks.
    pub fn with_provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider_override = Some(provider);
        self
    }

    pub async fn run(&self, input_path: &Path, options: RunOptions) -> Result<PathBuf, RunError> {
        let pipeline = &self.pipeline;

        // ── Resolve the referenced profiles ──────────────────────────────────
        let provider: Arc<dyn Provider> = match &self.provider_override {
            Some(provider) => provider.clone(),
            None => {
                let api: ApiProfile = self
                    .store
                    .load("api", &pipeline.provider)
                    .map_err(profile_error)?;
                Arc::from(from_profile(&api).map_err(|e| RunError::Config(e.to_string()))?)
            }
        };
        let prompt: PromptProfile = self
            .store
            .load("prompt", &pipeline.prompt)
            .map_err(profile_error)?;
        let parser_profile: ParserProfile = self
            .store
            .load("parser", &pipeline.parser)
            .map_err(profile_error)?;
        let parser = Parser::from_profile(&parser_profile)
            .map_err(|e| RunError::Config(e.to_string()))?;
        let line_policy = match pipeline.line_policy.as_deref().filter(|r| !r.is_empty()) {
            None => None,
            Some(reference) => {
                let profile: PolicyProfile = self
                    .store
                    .load("policy", reference)
                    .map_err(profile_error)?;
                Some(LinePolicy::from_profile(&profile).map_err(|e| RunError::Config(e.to_string()))?)
            }
        };
        let chunk_profile: ChunkProfile = self
            .store
            .load("chunk", &pipeline.chunk_policy)
            .map_err(profile_error)?;
        let mut chunk_policy = ChunkPolicy::from_profile(&chunk_profile)
            .map_err(|e| RunError::Config(e.to_string()))?;
        let chunk_type = chunk_policy.chunk_type().to_string();

        let context_cfg = prompt.context.clone();
        let use_jsonl = context_cfg.is_jsonl() && chunk_policy.is_line();
        if use_jsonl && !parser_profile.parser_type.trim().is_empty()
            && parser_profile.parser_type.trim() != "jsonl"
        {
            emit_warning(
                0,
                "source_format=jsonl forces JSONL parsing; selected parser will be ignored.",
                "quality",
            );
        }

        let apply_line_policy = line_policy.is_some()
            && chunk_policy.is_line()
            && pipeline.apply_line_policy != Some(false);

        // ── Load and chunk the document ──────────────────────────────────────
        if !input_path.exists() {
            return Err(RunError::Input(format!(
                "input file not found: {}",
                input_path.display()
            )));
        }
        let document =
            open_document(input_path).map_err(|e| RunError::Input(e.to_string()))?;
        if document.kind() == DocumentKind::Subtitle {
            // Empty cue lines must keep their 1:1 correspondence.
            chunk_policy.force_keep_empty();
        }
        let items = document.load().map_err(|e| RunError::Input(e.to_string()))?;
        let source_lines: Vec<String> = items
            .iter()
            .map(|item| item.text.trim_end_matches('\n').to_string())
            .collect();
        let blocks = chunk_policy.chunk(&items);

        let output_path = options
            .output_path
            .clone()
            .unwrap_or_else(|| default_output_path(input_path));
        let output_str = output_path.to_string_lossy().into_owned();
        let temp_progress_path = PathBuf::from(format!("{output_str}.temp.jsonl"));

        // ── Resume ───────────────────────────────────────────────────────────
        let fingerprint = Fingerprint {
            input: input_path.to_string_lossy().into_owned(),
            pipeline: pipeline.id.clone(),
            chunk_type: chunk_type.clone(),
        };
        let mut resume_entries: HashMap<usize, ResumeEntry> = HashMap::new();
        let mut resume_matched = false;
        if options.resume {
            let (entries, matched) = load_resume_file(&temp_progress_path, &fingerprint);
            resume_entries = entries;
            resume_matched = matched;
            if resume_entries.is_empty() {
                resume_entries = load_resume_cache(&output_str, options.cache_dir.as_deref());
                resume_matched = false;
            }
        }

        // ── Processing configuration (profile + CLI overrides) ───────────────
        let processing_cfg = pipeline.processing.clone().unwrap_or_default();

        let rules_pre_spec = options
            .rules_pre
            .as_ref()
            .map(|s| serde_yaml::Value::String(s.clone()))
            .or_else(|| processing_cfg.rules_pre.clone())
            .or_else(|| pipeline.rules_pre.clone());
        let rules_post_spec = options
            .rules_post
            .as_ref()
            .map(|s| serde_yaml::Value::String(s.clone()))
            .or_else(|| processing_cfg.rules_post.clone())
            .or_else(|| pipeline.rules_post.clone());
        let glossary_spec = options
            .glossary
            .as_ref()
            .map(|s| serde_yaml::Value::String(s.clone()))
            .or_else(|| processing_cfg.glossary.clone())
            .or_else(|| pipeline.glossary.clone());

        let source_lang = options
            .source_lang
            .clone()
            .or_else(|| processing_cfg.source_lang.clone())
            .unwrap_or_else(|| "ja".to_string());
        // Quality checks and text protection are opt-in.
        let enable_quality = options
            .enable_quality
            .or(processing_cfg.enable_quality)
            .unwrap_or(false);
        let enable_text_protect = options
            .text_protect
            .or(processing_cfg.text_protect)
            .unwrap_or(false);
        let strict_line_count = processing_cfg.strict_line_count.unwrap_or(false);

        let glossary_text = load_glossary_text(glossary_spec.as_ref());
        let pre_rules = resolve_rules(rules_pre_spec.as_ref(), Some(&self.store));
        let post_rules = resolve_rules(rules_post_spec.as_ref(), Some(&self.store));
        let glossary_map = load_glossary(glossary_spec.as_ref());

        let processor = (!pre_rules.is_empty()
            || !post_rules.is_empty()
            || !glossary_map.is_empty()
            || enable_text_protect
            || enable_quality)
            .then(|| {
                Processor::new(ProcessingOptions {
                    rules_pre: pre_rules,
                    rules_post: post_rules,
                    glossary: glossary_map,
                    source_lang: source_lang.clone(),
                    strict_line_count,
                    enable_quality,
                    enable_text_protect,
                    subtitle_protection: document.kind() == DocumentKind::Subtitle,
                })
            });

        // Prompt-facing source lines: pre-transformed when pre rules exist.
        // The untouched `source_lines` stay authoritative for line-policy
        // comparisons and output reconstruction.
        let prompt_source_lines: Vec<String> = match &processor {
            Some(p) if p.has_pre_rules() => {
                source_lines.iter().map(|line| p.apply_pre(line)).collect()
            }
            _ => source_lines.clone(),
        };

        // ── Settings ─────────────────────────────────────────────────────────
        let settings = pipeline.settings.clone();
        let max_retries: u32 = settings
            .max_retries
            .as_ref()
            .and_then(lenient_i64)
            .or_else(|| provider.profile().max_retries.as_ref().and_then(lenient_i64))
            .map(|v| v.max(0) as u32)
            .unwrap_or(3);
        let concurrency: i64 = settings
            .concurrency
            .as_ref()
            .and_then(lenient_i64)
            .or_else(|| provider.profile().concurrency.as_ref().and_then(lenient_i64))
            .unwrap_or(1);

        let adaptive = (concurrency == 0).then(|| {
            Arc::new(AdaptiveConcurrency::with_max_limit(
                blocks.len().clamp(1, ADAPTIVE_MAX_LIMIT),
            ))
        });
        let fixed_concurrency = concurrency.clamp(1, MAX_CONCURRENCY) as usize;

        // ── Progress tracking & temp-progress log ────────────────────────────
        let tracker = Arc::new(ProgressTracker::new(
            blocks.len(),
            source_lines.len(),
            source_lines.iter().map(|l| l.chars().count() as u64).sum(),
        ));
        tracker.set_api_url(provider.profile().base_url.clone());
        tracker.set_concurrency(match &adaptive {
            Some(a) => a.get_limit(),
            None => fixed_concurrency,
        });

        let append = options.resume && !resume_entries.is_empty() && resume_matched;
        let temp = match TempProgress::open(&temp_progress_path, append, &fingerprint) {
            Ok(t) => Some(Arc::new(t)),
            Err(e) => {
                warn!(path = %temp_progress_path.display(), error = %e, "temp-progress disabled");
                None
            }
        };

        // ── Pre-fill resumed blocks ──────────────────────────────────────────
        let mut translated: Vec<Option<TextBlock>> = vec![None; blocks.len()];
        if !resume_entries.is_empty() {
            let mut resumed_blocks = 0usize;
            let mut resumed_lines = 0u64;
            let mut resumed_chars = 0u64;
            for (idx, block) in blocks.iter().enumerate() {
                let Some(entry) = resume_entries.get(&idx) else {
                    continue;
                };
                translated[idx] = Some(TextBlock::new(
                    idx + 1,
                    entry.dst.clone(),
                    block.metadata.clone(),
                ));
                resumed_blocks += 1;
                if !entry.dst.is_empty() {
                    resumed_lines += entry.dst.matches('\n').count() as u64 + 1;
                    resumed_chars += entry.dst.chars().count() as u64;
                }
            }
            if resumed_blocks > 0 {
                debug!(resumed_blocks, "resuming from prior progress");
                tracker.seed_progress(resumed_blocks, resumed_lines, resumed_chars);
            }
        }

        // ── Dispatch ─────────────────────────────────────────────────────────
        let ctx = Arc::new(WorkerCtx {
            provider: provider.clone(),
            prompt,
            parser,
            line_policy,
            processor,
            settings: settings.clone(),
            context_cfg,
            tracker: tracker.clone(),
            temp: temp.clone(),
            adaptive: adaptive.clone(),
            source_lines: source_lines.clone(),
            prompt_source_lines,
            glossary_text,
            apply_line_policy,
            use_jsonl,
            max_retries,
            cancel: options.cancel.clone(),
            line_errors: Mutex::new(Vec::new()),
        });

        let pending: Vec<usize> = translated
            .iter()
            .enumerate()
            .filter(|(_, block)| block.is_none())
            .map(|(idx, _)| idx)
            .collect();

        self.dispatch(&ctx, &blocks, &pending, &mut translated, fixed_concurrency)
            .await?;

        if options.cancel.is_cancelled() && translated.iter().any(|b| b.is_none()) {
            // Temp progress stays on disk; completed blocks remain resumable.
            return Err(RunError::Runtime("run cancelled".to_string()));
        }
        if translated.iter().any(|b| b.is_none()) {
            return Err(RunError::Incomplete);
        }
        let mut translated: Vec<TextBlock> = translated.into_iter().flatten().collect();

        // ── Ordered output ───────────────────────────────────────────────────
        hibiki_events::emit_output_path(&output_str);

        if let Some(processor) = ctx.processor.as_ref().filter(|p| p.options().enable_quality) {
            let output_lines: Vec<String> =
                translated.iter().map(|b| b.prompt_text.clone()).collect();
            if !source_lines.is_empty() && output_lines.len() == source_lines.len() {
                let warnings = processor.check_quality(&source_lines, &output_lines);
                if !warnings.is_empty() {
                    write_jsonl_sidecar(
                        &PathBuf::from(format!("{output_str}.quality_warnings.jsonl")),
                        warnings.iter().map(|w| serde_json::to_value(w).unwrap_or_default()),
                    );
                    for warning in &warnings {
                        emit_warning(warning.line, &warning.message, &warning.warning_type);
                    }
                }
            }
        }

        {
            let line_errors = ctx.line_errors.lock().unwrap();
            if !line_errors.is_empty() {
                write_jsonl_sidecar(
                    &PathBuf::from(format!("{output_str}.line_errors.jsonl")),
                    line_errors.iter().cloned(),
                );
            }
        }

        // Strip the trailing newline the block decoder kept on merged text.
        for block in &mut translated {
            if block.prompt_text.ends_with('\n') {
                block.prompt_text.pop();
            }
        }

        document
            .save(&output_path, &translated)
            .map_err(|e| RunError::Runtime(e.to_string()))?;

        if options.save_cache {
            self.save_cache(
                &options,
                &output_str,
                input_path,
                &blocks,
                &translated,
                provider.as_ref(),
                glossary_spec.as_ref(),
                fixed_concurrency,
                &chunk_type,
            );
        }

        tracker.emit_final_stats();
        let _ = std::fs::remove_file(&temp_progress_path);
        Ok(output_path)
    }

    async fn dispatch(
        &self,
        ctx: &Arc<WorkerCtx>,
        blocks: &[TextBlock],
        pending: &[usize],
        translated: &mut [Option<TextBlock>],
        fixed_concurrency: usize,
    ) -> Result<(), RunError> {
        if pending.is_empty() {
            return Ok(());
        }

        let sequential = pending.len() <= 1 || (ctx.adaptive.is_none() && fixed_concurrency <= 1);
        if sequential {
            for &idx in pending {
                if ctx.cancel.is_cancelled() {
                    break;
                }
                let outcome = translate_block(ctx.clone(), idx, blocks[idx].clone()).await;
                handle_outcome(ctx, blocks, translated, outcome);
            }
            return Ok(());
        }

        if let Some(adaptive) = ctx.adaptive.clone() {
            let mut join_set: JoinSet<Outcome> = JoinSet::new();
            let mut next_pos = 0usize;
            while next_pos < pending.len() || !join_set.is_empty() {
                if !ctx.cancel.is_cancelled() {
                    let limit = adaptive.get_limit();
                    ctx.tracker.set_concurrency(limit);
                    while next_pos < pending.len() && join_set.len() < limit {
                        let idx = pending[next_pos];
                        next_pos += 1;
                        join_set.spawn(translate_block(ctx.clone(), idx, blocks[idx].clone()));
                    }
                } else if join_set.is_empty() {
                    break;
                }
                match join_set.join_next().await {
                    None => continue,
                    Some(Err(join_error)) => {
                        return Err(RunError::Runtime(format!("worker panicked: {join_error}")))
                    }
                    Some(Ok(outcome)) => handle_outcome(ctx, blocks, translated, outcome),
                }
            }
            return Ok(());
        }

        // Fixed worker pool: everything spawns up front, a semaphore caps the
        // in-flight set.
        let semaphore = Arc::new(tokio::sync::Semaphore::new(fixed_concurrency));
        let mut join_set: JoinSet<Outcome> = JoinSet::new();
        for &idx in pending {
            let ctx = ctx.clone();
            let block = blocks[idx].clone();
            let semaphore = semaphore.clone();
            join_set.spawn(async move {
                let _permit = semaphore.acquire().await;
                translate_block(ctx, idx, block).await
            });
        }
        while let Some(result) = join_set.join_next().await {
            match result {
                Err(join_error) => {
                    return Err(RunError::Runtime(format!("worker panicked: {join_error}")))
                }
                Ok(outcome) => handle_outcome(ctx, blocks, translated, outcome),
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn save_cache(
        &self,
        options: &RunOptions,
        output_str: &str,
        input_path: &Path,
        blocks: &[TextBlock],
        translated: &[TextBlock],
        provider: &dyn Provider,
        glossary_spec: Option<&serde_yaml::Value>,
        concurrency: usize,
        chunk_type: &str,
    ) {
        let cache = TranslationCache::new(
            output_str,
            options.cache_dir.as_deref().filter(|d| d.is_dir()),
            &input_path.to_string_lossy(),
        );
        for (idx, block) in blocks.iter().enumerate() {
            let Some(done) = translated.get(idx) else {
                continue;
            };
            cache.add_block(idx, &block.prompt_text, &done.prompt_text, Vec::new());
        }
        let model_name = provider
            .profile()
            .model
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .or_else(|| Some(self.pipeline.provider.clone()).filter(|p| !p.is_empty()))
            .or_else(|| Some(self.pipeline.id.clone()).filter(|p| !p.is_empty()))
            .unwrap_or_else(|| "unknown".to_string());
        let glossary_path = glossary_spec
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if cache.save(&CacheMeta {
            model_name,
            glossary_path,
            concurrency,
            engine_mode: "v2".to_string(),
            chunk_type: chunk_type.to_string(),
            pipeline_id: self.pipeline.id.clone(),
        }) {
            hibiki_events::emit_cache_path(&cache.cache_path().to_string_lossy());
        }
    }
}

fn profile_error(error: ProfileError) -> RunError {
    match error {
        ProfileError::NotFound { kind, reference } => {
            RunError::MissingProfile(format!("{kind}:{reference}"))
        }
        ProfileError::InvalidId(id) => RunError::MissingProfile(format!("invalid id {id}")),
        other => RunError::Config(other.to_string()),
    }
}

fn default_output_path(input_path: &Path) -> PathBuf {
    let stem = input_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let ext = input_path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    input_path.with_file_name(format!("{stem}_translated{ext}"))
}

fn write_jsonl_sidecar(path: &Path, entries: impl Iterator<Item = serde_json::Value>) {
    use std::io::Write;
    let Ok(mut file) = std::fs::File::create(path) else {
        warn!(path = %path.display(), "could not write sidecar file");
        return;
    };
    for entry in entries {
        let _ = writeln!(file, "{entry}");
    }
}

fn handle_outcome(
    ctx: &Arc<WorkerCtx>,
    blocks: &[TextBlock],
    translated: &mut [Option<TextBlock>],
    outcome: Outcome,
) {
    match outcome {
        Outcome::Cancelled => {}
        Outcome::Done { idx, block, failed } => {
            if !failed {
                if let Some(adaptive) = &ctx.adaptive {
                    adaptive.note_success();
                }
            }
            ctx.tracker
                .block_done(idx, &blocks[idx].prompt_text, &block.prompt_text);
            translated[idx] = Some(block);
        }
    }
}

// ── Per-block worker ──────────────────────────────────────────────────────────

struct WorkerCtx {
    provider: Arc<dyn Provider>,
    prompt: PromptProfile,
    parser: Parser,
    line_policy: Option<LinePolicy>,
    processor: Option<Processor>,
    settings: Settings,
    context_cfg: ContextConfig,
    tracker: Arc<ProgressTracker>,
    temp: Option<Arc<TempProgress>>,
    adaptive: Option<Arc<AdaptiveConcurrency>>,
    /// Authoritative row vocabulary: item text, trailing newline stripped.
    source_lines: Vec<String>,
    /// Pre-rule-transformed lines used only for prompt construction.
    prompt_source_lines: Vec<String>,
    glossary_text: String,
    apply_line_policy: bool,
    use_jsonl: bool,
    max_retries: u32,
    cancel: CancellationToken,
    line_errors: Mutex<Vec<serde_json::Value>>,
}

enum Outcome {
    Done {
        idx: usize,
        block: TextBlock,
        failed: bool,
    },
    Cancelled,
}

#[derive(Debug)]
enum WorkerError {
    Provider(ProviderError),
    Parser(ParserError),
    Policy(LinePolicyError),
    Cancelled,
}

impl WorkerError {
    fn retry_type(&self) -> &'static str {
        match self {
            WorkerError::Policy(_) => "line_mismatch",
            WorkerError::Parser(_) => "empty",
            _ => "provider_error",
        }
    }

    fn message(&self) -> String {
        match self {
            WorkerError::Provider(e) => e.to_string(),
            WorkerError::Parser(e) => e.to_string(),
            WorkerError::Policy(e) => e.to_string(),
            WorkerError::Cancelled => "cancelled".to_string(),
        }
    }
}

/// `HTTP (\d{3})` status code embedded in a provider error message.
fn extract_status(error: &WorkerError) -> Option<u16> {
    let WorkerError::Provider(provider_error) = error else {
        return None;
    };
    let message = provider_error.to_string();
    let re = regex::Regex::new(r"HTTP (\d{3})").unwrap();
    re.captures(&message)
        .and_then(|caps| caps.get(1).unwrap().as_str().parse().ok())
}

async fn translate_block(ctx: Arc<WorkerCtx>, idx: usize, block: TextBlock) -> Outcome {
    if ctx.cancel.is_cancelled() {
        return Outcome::Cancelled;
    }

    let line_index = block.metadata.first().and_then(ItemMeta::line_index);
    let (blk_start, blk_end) = block.line_range();
    let active_lines = &ctx.prompt_source_lines;

    // ── Context & source assembly ────────────────────────────────────────────
    let mut context_before = String::new();
    let mut context_after = String::new();
    if !ctx.use_jsonl {
        if let Some(li) = line_index.filter(|_| !active_lines.is_empty()) {
            // Block mode: context spans the whole block's line range, not
            // just the first line.
            let block_end = (blk_end > blk_start).then_some(blk_end);
            (context_before, context_after) =
                build_context(active_lines, li, &ctx.context_cfg, block_end);
        }
    }

    let mut source_text = block.prompt_text.clone();
    if !ctx.use_jsonl {
        if let Some(processor) = &ctx.processor {
            source_text = processor.apply_pre(&source_text);
        }
    }
    let mut protector = ctx.processor.as_ref().and_then(|p| p.create_protector());
    if !ctx.use_jsonl {
        if let Some(protector) = protector.as_mut() {
            source_text = protector.protect(&source_text);
        }
    }

    let mut target_line_ids: Vec<usize> = Vec::new();
    if ctx.use_jsonl {
        if let Some(li) = line_index.filter(|_| !active_lines.is_empty()) {
            let (start, end) = resolve_source_window(active_lines.len(), li, &ctx.context_cfg);
            let before_start = start.saturating_sub(ctx.context_cfg.before_lines);
            let after_end = (end + ctx.context_cfg.after_lines).min(active_lines.len());
            context_before = build_jsonl_range(active_lines, before_start, start);
            context_after = build_jsonl_range(active_lines, end, after_end);

            let (window_lines, kept) =
                apply_protection_to_lines(active_lines, start, end, protector.take());
            protector = kept;
            source_text = build_jsonl_range(&window_lines, start, end);

            target_line_ids = filter_target_line_ids(&block.metadata, start, end);
            if target_line_ids.is_empty() {
                target_line_ids.push(li);
            }
        }
    }

    let inputs = PromptInputs {
        source: source_text,
        context_before,
        context_after,
        glossary: ctx.glossary_text.clone(),
        line_index,
    };
    let messages = build_messages(&ctx.prompt, &inputs);

    // Built once: pool-stamped requests keep retries on the same endpoint.
    let request = ctx.provider.build_request(&messages, &ctx.settings);

    let mut attempt: u32 = 0;
    let mut last_error: Option<WorkerError> = None;
    let mut last_translation: Option<String> = None;

    match request {
        Err(build_error) => {
            // A request that cannot be built will not improve with retries.
            last_error = Some(WorkerError::Provider(build_error));
        }
        Ok(request) => {
            while attempt <= ctx.max_retries {
                match attempt_block(
                    &ctx,
                    &request,
                    &block,
                    line_index,
                    &target_line_ids,
                    protector.as_ref(),
                    &mut last_translation,
                )
                .await
                {
                    Ok(translated) => {
                        if let Some(temp) = &ctx.temp {
                            temp.write_entry(idx, &block.prompt_text, &translated);
                        }
                        return Outcome::Done {
                            idx,
                            block: TextBlock::new(idx + 1, translated, block.metadata.clone()),
                            failed: false,
                        };
                    }
                    Err(WorkerError::Cancelled) => return Outcome::Cancelled,
                    Err(error) => {
                        attempt += 1;
                        if let WorkerError::Provider(provider_error) = &error {
                            if let Some(adaptive) = &ctx.adaptive {
                                adaptive.note_error(&provider_error.to_string());
                            }
                        }
                        ctx.tracker.note_retry(extract_status(&error));
                        emit_retry(idx + 1, attempt, error.retry_type());
                        last_error = Some(error);
                    }
                }
            }
        }
    }

    // ── Retries exhausted: record and fall back ──────────────────────────────
    let error = last_error.expect("exhaustion implies an error");
    let status = extract_status(&error);
    let is_policy_error = matches!(error, WorkerError::Policy(_));

    let fallback = if is_policy_error {
        // Keep the best candidate we saw; else leave the source line intact.
        last_translation.unwrap_or_else(|| {
            line_index
                .and_then(|li| ctx.source_lines.get(li).cloned())
                .unwrap_or_else(|| block.prompt_text.clone())
        })
    } else {
        block.prompt_text.clone()
    };

    let line_number = line_index.unwrap_or(blk_start) + 1;
    let mut record = json!({
        "line": line_number,
        "error": error.message(),
    });
    if let Some(status) = status {
        record["status"] = json!(status);
    }
    ctx.line_errors.lock().unwrap().push(record);
    ctx.tracker.note_error(status);

    if let Some(temp) = &ctx.temp {
        temp.write_entry(idx, &block.prompt_text, &fallback);
    }
    Outcome::Done {
        idx,
        block: TextBlock::new(idx + 1, fallback, block.metadata.clone()),
        failed: true,
    }
}

/// One send→parse→post→line-policy attempt.
async fn attempt_block(
    ctx: &WorkerCtx,
    request: &hibiki_provider::ProviderRequest,
    block: &TextBlock,
    line_index: Option<usize>,
    target_line_ids: &[usize],
    protector: Option<&hibiki_process::Protector>,
    last_translation: &mut Option<String>,
) -> Result<String, WorkerError> {
    let response = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(WorkerError::Cancelled),
        result = ctx.provider.send(request) => result.map_err(WorkerError::Provider)?,
    };
    let (input_tokens, output_tokens) = response.token_usage();
    ctx.tracker.note_request(input_tokens, output_tokens);

    let mut translated = if ctx.use_jsonl && !target_line_ids.is_empty() {
        parse_jsonl_response(&response.text, target_line_ids).map_err(WorkerError::Parser)?
    } else {
        let parsed = ctx.parser.parse(&response.text).map_err(WorkerError::Parser)?;
        parsed.text.trim_matches('\n').to_string()
    };

    if let Some(processor) = &ctx.processor {
        translated = processor.apply_post(&translated, Some(&block.prompt_text), protector);
    }
    *last_translation = Some(translated.clone());

    if ctx.apply_line_policy {
        if let (Some(policy), Some(li)) = (&ctx.line_policy, line_index) {
            if li < ctx.source_lines.len() {
                if let Some(extracted) = lineformat::extract_line_for_policy(&translated, li, None)
                {
                    translated = extracted;
                }
                if translated.contains('\n') {
                    return Err(WorkerError::Policy(LinePolicyError(
                        "LinePolicy: line count mismatch".to_string(),
                    )));
                }
                let checked = policy
                    .apply(
                        std::slice::from_ref(&ctx.source_lines[li]),
                        vec![translated.clone()],
                    )
                    .map_err(WorkerError::Policy)?;
                if checked.len() != 1 {
                    return Err(WorkerError::Policy(LinePolicyError(
                        "LinePolicy: unexpected line count".to_string(),
                    )));
                }
                translated = checked.into_iter().next().unwrap();
                *last_translation = Some(translated.clone());
            }
        }
    }

    Ok(translated)
}

// ── Context helpers ───────────────────────────────────────────────────────────

/// `(before, after)` context strings around `line_index` per the prompt's
/// context configuration.  `block_end` (exclusive) widens the window for
/// multi-line blocks so the "after" context starts past the block.
fn build_context(
    source_lines: &[String],
    line_index: usize,
    cfg: &ContextConfig,
    block_end: Option<usize>,
) -> (String, String) {
    if cfg.before_lines == 0 && cfg.after_lines == 0 {
        return (String::new(), String::new());
    }
    let content_end = block_end.unwrap_or(line_index + 1);
    let start = line_index.saturating_sub(cfg.before_lines);
    let end = (content_end + cfg.after_lines).min(source_lines.len());
    let before = source_lines[start..line_index.min(source_lines.len())]
        .join(&cfg.joiner)
        .trim()
        .to_string();
    let after = if content_end < end {
        source_lines[content_end..end].join(&cfg.joiner).trim().to_string()
    } else {
        String::new()
    };
    (before, after)
}

/// `[start, end)` JSONL source window for a line-mode block.
fn resolve_source_window(total: usize, line_index: usize, cfg: &ContextConfig) -> (usize, usize) {
    let window = cfg.source_lines.unwrap_or(0).max(1);
    let start = line_index.min(total);
    let end = (start + window).min(total);
    (start, end)
}

/// `jsonline{"<1-based-idx>": "<text>"}` rows for `[start, end)`.
fn build_jsonl_range(source_lines: &[String], start: usize, end: usize) -> String {
    if start >= end {
        return String::new();
    }
    let rows: Vec<String> = (start..end.min(source_lines.len()))
        .map(|idx| {
            let payload = json!({ (idx + 1).to_string(): source_lines[idx] });
            format!("jsonline{payload}")
        })
        .collect();
    rows.join("\n").trim().to_string()
}

/// Protect the `[start, end)` window line-by-line.  If protection changes the
/// line count the original lines are kept and the protector is dropped (its
/// map would no longer correspond to what was sent).
fn apply_protection_to_lines(
    lines: &[String],
    start: usize,
    end: usize,
    protector: Option<hibiki_process::Protector>,
) -> (Vec<String>, Option<hibiki_process::Protector>) {
    let Some(mut protector) = protector else {
        return (lines.to_vec(), None);
    };
    if start >= end {
        return (lines.to_vec(), Some(protector));
    }
    let segment = lines[start..end.min(lines.len())].join("\n");
    if segment.is_empty() {
        return (lines.to_vec(), Some(protector));
    }
    let protected = protector.protect(&segment);
    let protected_lines: Vec<String> = protected.split('\n').map(str::to_string).collect();
    if protected_lines.len() != end - start {
        return (lines.to_vec(), None);
    }
    let mut merged = lines.to_vec();
    merged.splice(start..end, protected_lines);
    (merged, Some(protector))
}

/// Line ids from block metadata restricted to the source window, deduplicated
/// in order.
fn filter_target_line_ids(metadata: &[ItemMeta], start: usize, end: usize) -> Vec<usize> {
    let mut seen = HashSet::new();
    metadata
        .iter()
        .filter_map(ItemMeta::line_index)
        .filter(|idx| *idx >= start && *idx < end)
        .filter(|idx| seen.insert(*idx))
        .collect()
}

/// The runner-owned JSONL extractor: correlate the model's per-line output
/// with the line ids present in the block.  For each expected id, take the
/// map entry for its 1-based key, else the ordered fallback at the same
/// relative position; any remainder is a parser failure.
fn parse_jsonl_response(text: &str, expected_line_ids: &[usize]) -> Result<String, ParserError> {
    let (entries, ordered) = lineformat::parse_jsonl_entries(text);
    if entries.is_empty() && ordered.is_empty() {
        return Err(ParserError("JsonlParser: empty output".to_string()));
    }
    if !expected_line_ids.is_empty() {
        let mut missing: Vec<String> = Vec::new();
        let mut lines: Vec<String> = Vec::new();
        for (position, line_id) in expected_line_ids.iter().enumerate() {
            let key = (line_id + 1).to_string();
            if let Some(value) = entries.get(&key) {
                lines.push(value.clone());
                continue;
            }
            if let Some(value) = ordered.get(position) {
                lines.push(value.clone());
                continue;
            }
            missing.push(key);
        }
        if !missing.is_empty() {
            return Err(ParserError(format!(
                "JsonlParser: missing lines {}",
                missing.join(",")
            )));
        }
        return Ok(lines.join("\n").trim_matches('\n').to_string());
    }
    if !entries.is_empty() {
        let mut keyed: Vec<(i64, &String)> = entries
            .iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|n| (n, v)))
            .collect();
        if keyed.len() == entries.len() {
            keyed.sort_by_key(|(n, _)| *n);
            return Ok(keyed
                .into_iter()
                .map(|(_, v)| v.clone())
                .collect::<Vec<_>>()
                .join("\n")
                .trim_matches('\n')
                .to_string());
        }
        return Ok(entries
            .values()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
            .trim_matches('\n')
            .to_string());
    }
    Ok(ordered.join("\n").trim_matches('\n').to_string())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn cfg(yaml: &str) -> ContextConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn context_window_around_line() {
        let source = lines(&["l0", "l1", "l2", "l3", "l4"]);
        let (before, after) =
            build_context(&source, 2, &cfg("before_lines: 2\nafter_lines: 1"), None);
        assert_eq!(before, "l0\nl1");
        assert_eq!(after, "l3");
    }

    #[test]
    fn context_block_end_skips_block_body() {
        let source = lines(&["l0", "l1", "l2", "l3", "l4"]);
        let (before, after) =
            build_context(&source, 1, &cfg("before_lines: 1\nafter_lines: 2"), Some(3));
        assert_eq!(before, "l0");
        assert_eq!(after, "l3\nl4");
    }

    #[test]
    fn context_disabled_when_no_lines_requested() {
        let source = lines(&["l0", "l1"]);
        let (before, after) = build_context(&source, 1, &cfg("joiner: \" / \""), None);
        assert_eq!(before, "");
        assert_eq!(after, "");
    }

    #[test]
    fn context_clamps_at_document_edges() {
        let source = lines(&["l0", "l1"]);
        let (before, after) =
            build_context(&source, 0, &cfg("before_lines: 5\nafter_lines: 5"), None);
        assert_eq!(before, "");
        assert_eq!(after, "l1");
    }

    #[test]
    fn source_window_defaults_to_one_line() {
        assert_eq!(resolve_source_window(10, 3, &cfg("{}")), (3, 4));
        assert_eq!(resolve_source_window(10, 8, &cfg("source_lines: 5")), (8, 10));
    }

    #[test]
    fn jsonl_range_rows_are_one_based() {
        let source = lines(&["A", "B", "C"]);
        let rendered = build_jsonl_range(&source, 0, 3);
        assert_eq!(
            rendered,
            "jsonline{\"1\":\"A\"}\njsonline{\"2\":\"B\"}\njsonline{\"3\":\"C\"}"
        );
        assert_eq!(build_jsonl_range(&source, 2, 2), "");
    }

    #[test]
    fn filter_target_ids_window_and_dedup() {
        let metadata = vec![
            ItemMeta::Line(1),
            ItemMeta::Line(2),
            ItemMeta::Line(2),
            ItemMeta::Line(7),
            ItemMeta::Token("x".into()),
        ];
        assert_eq!(filter_target_line_ids(&metadata, 1, 5), vec![1, 2]);
    }

    #[test]
    fn jsonl_response_reordered_by_expected_ids() {
        let reply = "jsonline{\"2\":\"β\"}\njsonline{\"1\":\"α\"}\njsonline{\"3\":\"γ\"}";
        let out = parse_jsonl_response(reply, &[0, 1, 2]).unwrap();
        assert_eq!(out, "α\nβ\nγ");
    }

    #[test]
    fn jsonl_response_ordered_fallback_fills_missing_ids() {
        let reply = "{\"text\": \"only\"}";
        // The single ordered entry serves position 0.
        let out = parse_jsonl_response(reply, &[4]).unwrap();
        assert_eq!(out, "only");
    }

    #[test]
    fn jsonl_response_missing_ids_error_lists_keys() {
        let reply = "jsonline{\"1\":\"a\"}";
        let err = parse_jsonl_response(reply, &[0, 1, 2]).unwrap_err();
        assert_eq!(err.0, "JsonlParser: missing lines 2,3");
    }

    #[test]
    fn jsonl_response_empty_output_errors() {
        assert!(parse_jsonl_response("no structure here", &[0]).is_err());
    }

    #[test]
    fn jsonl_response_without_expectations_sorts_by_key() {
        let reply = "jsonline{\"10\":\"ten\"}\njsonline{\"2\":\"two\"}";
        let out = parse_jsonl_response(reply, &[]).unwrap();
        assert_eq!(out, "two\nten");
    }

    #[test]
    fn protection_preserving_line_count_is_kept() {
        let source = lines(&["keep {a}", "plain", "also {b}"]);
        let protector = hibiki_process::Protector::new(&[r"\{\w+\}"]);
        let (merged, kept) = apply_protection_to_lines(&source, 0, 3, Some(protector));
        assert!(kept.is_some());
        assert!(merged[0].starts_with("keep @P"));
        assert_eq!(merged[1], "plain");
    }

    #[test]
    fn protection_changing_line_count_is_dropped() {
        // A pattern that swallows the newline would break row alignment.
        let source = lines(&["a", "b"]);
        let protector = hibiki_process::Protector::new(&["a\nb"]);
        let (merged, kept) = apply_protection_to_lines(&source, 0, 2, Some(protector));
        assert!(kept.is_none());
        assert_eq!(merged, source);
    }

    #[test]
    fn default_output_path_appends_translated() {
        assert_eq!(
            default_output_path(Path::new("/tmp/story.txt")),
            PathBuf::from("/tmp/story_translated.txt")
        );
        assert_eq!(
            default_output_path(Path::new("/tmp/noext")),
            PathBuf::from("/tmp/noext_translated")
        );
    }

    #[test]
    fn worker_error_retry_types() {
        assert_eq!(
            WorkerError::Parser(ParserError("x".into())).retry_type(),
            "empty"
        );
        assert_eq!(
            WorkerError::Policy(LinePolicyError("x".into())).retry_type(),
            "line_mismatch"
        );
        assert_eq!(
            WorkerError::Provider(ProviderError::MissingContent).retry_type(),
            "provider_error"
        );
    }

    #[test]
    fn status_extraction_from_provider_errors() {
        let error = WorkerError::Provider(ProviderError::Http {
            status: 503,
            body: "unavailable".into(),
        });
        assert_eq!(extract_status(&error), Some(503));
        let error = WorkerError::Provider(ProviderError::Network("timed out".into()));
        assert_eq!(extract_status(&error), None);
        let error = WorkerError::Parser(ParserError("HTTP 500 lookalike".into()));
        assert_eq!(extract_status(&error), None);
    }
}
