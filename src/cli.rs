// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Profile-driven document translation pipeline runner.
#[derive(Debug, Parser)]
#[command(name = "hibiki", version, about)]
pub struct Cli {
    /// Stderr trace verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Translate a document through a pipeline profile.
    Run {
        /// Input document (txt/srt/ass; plain text is the fallback).
        #[arg(long)]
        file: PathBuf,
        /// Pipeline profile id.
        #[arg(long)]
        pipeline: String,
        /// Profiles base directory (contains api/, prompt/, parser/, …).
        #[arg(long)]
        profiles_dir: PathBuf,
        /// Output path (default: `<input-stem>_translated<ext>`).
        #[arg(long)]
        output: Option<PathBuf>,
        /// Resume from the temp-progress file or a prior cache.
        #[arg(long)]
        resume: bool,
        /// Skip writing the block cache.
        #[arg(long)]
        no_cache: bool,
        /// Directory for the block cache (default: next to the output).
        #[arg(long)]
        cache_dir: Option<PathBuf>,
        /// Pre-rule override: a rule profile id or a JSON rule file.
        #[arg(long)]
        rules_pre: Option<String>,
        /// Post-rule override: a rule profile id or a JSON rule file.
        #[arg(long)]
        rules_post: Option<String>,
        /// Glossary override: a JSON file, inline JSON, or free-form text.
        #[arg(long)]
        glossary: Option<String>,
        /// Source language for quality checks.
        #[arg(long, value_parser = ["ja", "en", "ko", "zh"])]
        source_lang: Option<String>,
        /// Enable the output quality checker.
        #[arg(long, conflicts_with = "disable_quality")]
        enable_quality: bool,
        #[arg(long)]
        disable_quality: bool,
        /// Enable placeholder protection of tags/variables.
        #[arg(long, conflicts_with = "no_text_protect")]
        text_protect: bool,
        #[arg(long)]
        no_text_protect: bool,
    },

    /// List stored profiles of one kind.
    Profiles {
        /// Profile kind: api | prompt | parser | policy | chunk | pipeline | rule.
        kind: String,
        #[arg(long)]
        profiles_dir: PathBuf,
    },

    /// Validate a profile document and report errors/warnings.
    Validate {
        /// Profile kind the document claims to be.
        #[arg(long)]
        kind: String,
        /// YAML file to validate.
        #[arg(long)]
        file: PathBuf,
        /// Optional base dir for reference checks (pipeline profiles).
        #[arg(long)]
        profiles_dir: Option<PathBuf>,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_command_parses_required_flags() {
        let cli = Cli::parse_from([
            "hibiki",
            "run",
            "--file",
            "in.txt",
            "--pipeline",
            "main",
            "--profiles-dir",
            "/etc/hibiki/profiles",
        ]);
        match cli.command {
            Commands::Run {
                file,
                pipeline,
                no_cache,
                resume,
                ..
            } => {
                assert_eq!(file, PathBuf::from("in.txt"));
                assert_eq!(pipeline, "main");
                assert!(!no_cache);
                assert!(!resume);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn quality_flags_conflict() {
        let result = Cli::try_parse_from([
            "hibiki",
            "run",
            "--file",
            "in.txt",
            "--pipeline",
            "main",
            "--profiles-dir",
            "p",
            "--enable-quality",
            "--disable-quality",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn source_lang_restricted_to_supported_values() {
        let result = Cli::try_parse_from([
            "hibiki",
            "run",
            "--file",
            "in.txt",
            "--pipeline",
            "main",
            "--profiles-dir",
            "p",
            "--source-lang",
            "fr",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn verbosity_counts() {
        let cli = Cli::parse_from(["hibiki", "-vv", "profiles", "api", "--profiles-dir", "p"]);
        assert_eq!(cli.verbose, 2);
    }
}
