// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use hibiki_events::emit_error;
use hibiki_profile::{validate_profile, ProfileStore, PROFILE_KINDS};
use hibiki_runner::{PipelineRunner, RunError, RunOptions};

// ── Exit codes ────────────────────────────────────────────────────────────────

const EXIT_SUCCESS: u8 = 0;
const EXIT_INPUT_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_RUNTIME_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let code = match cli.command {
        Commands::Run {
            file,
            pipeline,
            profiles_dir,
            output,
            resume,
            no_cache,
            cache_dir,
            rules_pre,
            rules_post,
            glossary,
            source_lang,
            enable_quality,
            disable_quality,
            text_protect,
            no_text_protect,
        } => {
            let options = RunOptions {
                output_path: output,
                resume,
                save_cache: !no_cache,
                cache_dir,
                rules_pre,
                rules_post,
                glossary,
                source_lang,
                enable_quality: flag_pair(enable_quality, disable_quality),
                text_protect: flag_pair(text_protect, no_text_protect),
                cancel: CancellationToken::new(),
            };
            run_pipeline(&file, &pipeline, &profiles_dir, options).await
        }
        Commands::Profiles { kind, profiles_dir } => list_profiles(&kind, &profiles_dir),
        Commands::Validate {
            kind,
            file,
            profiles_dir,
        } => validate_file(&kind, &file, profiles_dir.as_deref()),
    };
    // Queued protocol events must reach stdout before the process exits.
    hibiki_events::flush();
    ExitCode::from(code)
}

/// `--enable-x` / `--disable-x` pairs fold into an optional override.
fn flag_pair(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

async fn run_pipeline(
    file: &Path,
    pipeline: &str,
    profiles_dir: &Path,
    options: RunOptions,
) -> u8 {
    if !profiles_dir.is_dir() {
        emit_error(
            "Pipeline Error",
            &format!("profiles directory not found: {}", profiles_dir.display()),
        );
        return EXIT_CONFIG_ERROR;
    }

    let store = ProfileStore::new(profiles_dir);
    let runner = match PipelineRunner::load(store, pipeline) {
        Ok(runner) => runner,
        Err(error) => return report_run_error(error),
    };

    // First Ctrl+C cancels the run cooperatively: no new blocks launch,
    // in-flight requests unwind at their next await, progress stays on disk
    // for --resume.
    let cancel = options.cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("[hibiki] interrupt received, finishing in-flight blocks");
            cancel.cancel();
        }
    });

    match runner.run(file, options).await {
        Ok(output_path) => {
            eprintln!("[hibiki] done: {}", output_path.display());
            EXIT_SUCCESS
        }
        Err(error) => report_run_error(error),
    }
}

fn report_run_error(error: RunError) -> u8 {
    emit_error("Pipeline Error", &error.to_string());
    match error {
        RunError::Input(_) | RunError::MissingProfile(_) => EXIT_INPUT_ERROR,
        RunError::Config(_) => EXIT_CONFIG_ERROR,
        RunError::Incomplete | RunError::Runtime(_) => EXIT_RUNTIME_ERROR,
    }
}

fn list_profiles(kind: &str, profiles_dir: &Path) -> u8 {
    if !PROFILE_KINDS.contains(&kind) {
        eprintln!(
            "[hibiki:error] unknown profile kind {kind:?} (expected one of: {})",
            PROFILE_KINDS.join(", ")
        );
        return EXIT_CONFIG_ERROR;
    }
    let store = ProfileStore::new(profiles_dir);
    let refs = store.list(kind);
    if refs.is_empty() {
        println!("No {kind} profiles found under {}", profiles_dir.display());
        return EXIT_SUCCESS;
    }
    let id_width = refs.iter().map(|r| r.profile_id.len()).max().unwrap_or(10).max(10);
    println!("{:<id_width$}  NAME", "ID", id_width = id_width);
    for profile in &refs {
        let chunk_suffix = profile
            .chunk_type
            .as_deref()
            .map(|t| format!("  [{t}]"))
            .unwrap_or_default();
        println!(
            "{:<id_width$}  {}{}",
            profile.profile_id,
            profile.name,
            chunk_suffix,
            id_width = id_width
        );
    }
    println!("\nTotal: {} profile(s)", refs.len());
    EXIT_SUCCESS
}

fn validate_file(kind: &str, file: &Path, profiles_dir: Option<&Path>) -> u8 {
    let text = match std::fs::read_to_string(file) {
        Ok(text) => text,
        Err(error) => {
            eprintln!("[hibiki:error] cannot read {}: {error}", file.display());
            return EXIT_INPUT_ERROR;
        }
    };
    let mapping: serde_yaml::Mapping = match serde_yaml::from_str(&text) {
        Ok(mapping) => mapping,
        Err(error) => {
            println!("errors:\n  - invalid_yaml: {error}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let store = profiles_dir.map(ProfileStore::new);
    let result = validate_profile(kind, &mapping, store.as_ref());
    if result.errors.is_empty() && result.warnings.is_empty() {
        println!("Profile is valid.");
        return EXIT_SUCCESS;
    }
    if !result.errors.is_empty() {
        println!("errors:");
        for error in &result.errors {
            println!("  - {error}");
        }
    }
    if !result.warnings.is_empty() {
        println!("warnings:");
        for warning in &result.warnings {
            println!("  - {warning}");
        }
    }
    if result.errors.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_CONFIG_ERROR
    }
}

fn init_logging(verbosity: u8) {
    // Stdout carries the JSON event protocol; all tracing goes to stderr.
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
