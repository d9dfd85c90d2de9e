// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end pipeline runs against scripted mock providers.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hibiki_provider::mock::{MockOutcome, MockProvider};
use hibiki_provider::Provider;
use hibiki_runner::{Fingerprint, PipelineRunner, RunError, RunOptions, TempProgress};

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn profiles_dir(&self) -> PathBuf {
        self.dir.path().join("profiles")
    }

    fn write_profile(&self, kind: &str, id: &str, body: &str) {
        let dir = self.profiles_dir().join(kind);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{id}.yaml")), body).unwrap();
    }

    fn write_input(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    /// Baseline profile set: raw-source prompt, plain parser, line chunking
    /// with empties kept, tolerant line policy.
    fn with_base_profiles(self) -> Self {
        self.write_profile("prompt", "raw", "id: raw\n");
        self.write_profile("parser", "plain", "id: plain\ntype: plain\n");
        self.write_profile(
            "chunk",
            "per-line",
            "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
        );
        self.write_profile("policy", "tolerant", "id: tolerant\ntype: tolerant\n");
        self.write_profile(
            "pipeline",
            "main",
            "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\nline_policy: tolerant\nsettings:\n  max_retries: 1\n  concurrency: 1\n",
        );
        self
    }

    fn runner(&self, provider: Arc<dyn Provider>) -> PipelineRunner {
        let store = hibiki_profile::ProfileStore::new(self.profiles_dir());
        PipelineRunner::load(store, "main")
            .unwrap()
            .with_provider(provider)
    }
}

fn hello_world_provider() -> Arc<MockProvider> {
    Arc::new(MockProvider::with_handler(|request| {
        let content = &request.messages.last().unwrap().content;
        if content.contains("hello") {
            MockOutcome::text("你好")
        } else {
            MockOutcome::text("世界")
        }
    }))
}

// ── S1: plain line-mode run ───────────────────────────────────────────────────

#[tokio::test]
async fn plain_line_run_translates_in_order() {
    let fixture = Fixture::new().with_base_profiles();
    let input = fixture.write_input("in.txt", "hello\nworld\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = hello_world_provider();
    let result = fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(result, output);
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "你好\n世界\n");
    assert_eq!(provider.call_count(), 2);

    // Cache holds both blocks at their indices.
    let cache_path = PathBuf::from(format!("{}.cache.json", output.display()));
    let cache: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&cache_path).unwrap()).unwrap();
    assert_eq!(cache["version"], "2.0");
    assert_eq!(cache["engineMode"], "v2");
    assert_eq!(cache["chunkType"], "line");
    assert_eq!(cache["pipelineId"], "main");
    let blocks = cache["blocks"].as_array().unwrap();
    assert_eq!(blocks.len(), 2);
    assert_eq!(blocks[0]["index"], 0);
    assert_eq!(blocks[0]["dst"], "你好");
    assert_eq!(blocks[1]["index"], 1);
    assert_eq!(blocks[1]["dst"], "世界");

    // A successful run unlinks its temp-progress file.
    let temp = PathBuf::from(format!("{}.temp.jsonl", output.display()));
    assert!(!temp.exists());
}

// ── S2: resume after a partial run ────────────────────────────────────────────

#[tokio::test]
async fn resume_skips_blocks_from_matching_temp_file() {
    let fixture = Fixture::new().with_base_profiles();
    let input = fixture.write_input("in.txt", "hello\nworld\n");
    let output = fixture.dir.path().join("out.txt");

    // Simulate a crashed first run that completed block 0 only.
    let fingerprint = Fingerprint {
        input: input.to_string_lossy().into_owned(),
        pipeline: "main".into(),
        chunk_type: "line".into(),
    };
    let temp_path = PathBuf::from(format!("{}.temp.jsonl", output.display()));
    let temp = TempProgress::open(&temp_path, false, &fingerprint).unwrap();
    temp.write_entry(0, "hello", "你好");
    drop(temp);

    // The provider refuses "hello": resume must not re-dispatch block 0.
    let provider = Arc::new(MockProvider::with_handler(|request| {
        let content = &request.messages.last().unwrap().content;
        if content.contains("hello") {
            MockOutcome::http(500, "block 0 must come from resume")
        } else {
            MockOutcome::text("世界")
        }
    }));

    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                resume: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "你好\n世界\n");
    assert_eq!(provider.call_count(), 1);
}

// ── Fingerprint rejection ─────────────────────────────────────────────────────

#[tokio::test]
async fn mismatched_fingerprint_discards_temp_entries() {
    let fixture = Fixture::new().with_base_profiles();
    let input = fixture.write_input("in.txt", "hello\nworld\n");
    let output = fixture.dir.path().join("out.txt");

    let stale = Fingerprint {
        input: "someone/else.txt".into(),
        pipeline: "other-pipeline".into(),
        chunk_type: "block".into(),
    };
    let temp_path = PathBuf::from(format!("{}.temp.jsonl", output.display()));
    let temp = TempProgress::open(&temp_path, false, &stale).unwrap();
    temp.write_entry(0, "hello", "STALE");
    drop(temp);

    let provider = hello_world_provider();
    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                resume: true,
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Both blocks were re-translated; the stale entry never surfaced.
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "你好\n世界\n");
    assert_eq!(provider.call_count(), 2);
}

// ── S3: JSONL line mode ───────────────────────────────────────────────────────

#[tokio::test]
async fn jsonl_mode_reorders_scrambled_replies() {
    let fixture = Fixture::new();
    fixture.write_profile(
        "prompt",
        "raw",
        "id: raw\ncontext:\n  source_format: jsonl\n  source_lines: 3\n",
    );
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "per-line",
        "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\nsettings:\n  max_retries: 0\n  concurrency: 1\n",
    );
    let input = fixture.write_input("in.txt", "A\nB\nC\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::with_handler(|request| {
        let content = &request.messages.last().unwrap().content;
        // The first block's window covers the whole document, presented
        // line-by-line in jsonline form; later windows start further down.
        if content.contains(r#"jsonline{"1":"A"}"#) {
            assert!(content.contains(r#"jsonline{"2":"B"}"#), "payload: {content}");
            assert!(content.contains(r#"jsonline{"3":"C"}"#), "payload: {content}");
        }
        MockOutcome::text("jsonline{\"2\":\"β\"}\njsonline{\"1\":\"α\"}\njsonline{\"3\":\"γ\"}")
    }));

    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "α\nβ\nγ\n");
}

// ── Best-effort completion ────────────────────────────────────────────────────

#[tokio::test]
async fn provider_exhaustion_falls_back_to_source_lines() {
    let fixture = Fixture::new().with_base_profiles();
    let input = fixture.write_input("in.txt", "hello\nworld\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::with_handler(|_| {
        MockOutcome::http(503, "permanently down")
    }));

    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Structural integrity preserved: source lines pass through untouched.
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "hello\nworld\n");
    // max_retries = 1 → two attempts per block.
    assert_eq!(provider.call_count(), 4);

    let errors_path = PathBuf::from(format!("{}.line_errors.jsonl", output.display()));
    let errors = std::fs::read_to_string(&errors_path).unwrap();
    let records: Vec<serde_json::Value> = errors
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["status"], 503);
    assert!(records[0]["error"].as_str().unwrap().contains("HTTP 503"));
}

#[tokio::test]
async fn line_policy_exhaustion_keeps_last_candidate() {
    let fixture = Fixture::new();
    fixture.write_profile("prompt", "raw", "id: raw\n");
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "per-line",
        "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
    );
    fixture.write_profile(
        "policy",
        "no-kana",
        "id: no-kana\ntype: strict\noptions:\n  source_lang: ja\n  checks: [kana_trace]\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\nline_policy: no-kana\nsettings:\n  max_retries: 1\n  concurrency: 1\n",
    );
    let input = fixture.write_input("in.txt", "何か\n");
    let output = fixture.dir.path().join("out.txt");

    // Every attempt returns a kana-bearing candidate the policy rejects.
    let provider = Arc::new(MockProvider::always_text("まだかな"));
    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // Fallback is the last candidate, not the source line.
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "まだかな\n");
    assert_eq!(provider.call_count(), 2);

    let errors_path = PathBuf::from(format!("{}.line_errors.jsonl", output.display()));
    let errors = std::fs::read_to_string(&errors_path).unwrap();
    assert!(errors.contains("kana_trace"));
    assert!(errors.contains("\"line\":1"));
}

// ── Retry then success ────────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failure_is_retried_to_success() {
    let fixture = Fixture::new().with_base_profiles();
    let input = fixture.write_input("in.txt", "hello\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::scripted(vec![
        MockOutcome::http(503, "hiccup"),
        MockOutcome::text("你好"),
    ]));

    fixture
        .runner(provider.clone())
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "你好\n");
    assert_eq!(provider.call_count(), 2);
    // No line errors were recorded for a recovered block.
    assert!(!PathBuf::from(format!("{}.line_errors.jsonl", output.display())).exists());
}

// ── Order preservation under concurrency ──────────────────────────────────────

#[tokio::test]
async fn concurrent_dispatch_preserves_source_order() {
    let fixture = Fixture::new();
    fixture.write_profile("prompt", "raw", "id: raw\n");
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "per-line",
        "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\nsettings:\n  max_retries: 0\n  concurrency: 4\n",
    );
    let lines: Vec<String> = (0..12).map(|i| format!("line-{i}")).collect();
    let input = fixture.write_input("in.txt", &format!("{}\n", lines.join("\n")));
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::with_handler(|request| {
        let content = request.messages.last().unwrap().content.clone();
        MockOutcome::text(content.replace("line-", "row-"))
    }));

    fixture
        .runner(provider)
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let expected: Vec<String> = (0..12).map(|i| format!("row-{i}")).collect();
    assert_eq!(
        std::fs::read_to_string(&output).unwrap(),
        format!("{}\n", expected.join("\n"))
    );
}

#[tokio::test]
async fn adaptive_dispatch_completes_all_blocks() {
    let fixture = Fixture::new();
    fixture.write_profile("prompt", "raw", "id: raw\n");
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "per-line",
        "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\nsettings:\n  max_retries: 0\n  concurrency: 0\n",
    );
    let input = fixture.write_input("in.txt", "a\nb\nc\nd\ne\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::with_handler(|request| {
        MockOutcome::text(request.messages.last().unwrap().content.to_uppercase())
    }));

    fixture
        .runner(provider)
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "A\nB\nC\nD\nE\n");
}

// ── S6: block chunking end-to-end ─────────────────────────────────────────────

#[tokio::test]
async fn block_chunking_reconstructs_document_shape() {
    let fixture = Fixture::new();
    fixture.write_profile("prompt", "raw", "id: raw\n");
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "sized",
        "id: sized\nchunk_type: block\noptions:\n  target_chars: 10\n  max_chars: 20\n  enable_balance: true\n  balance_threshold: 0.6\n  balance_count: 2\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: sized\nsettings:\n  max_retries: 0\n  concurrency: 1\n",
    );
    let mut content = "aaaa\n".repeat(6);
    content.push_str("bb\n");
    let input = fixture.write_input("in.txt", &content);
    let output = fixture.dir.path().join("out.txt");

    // Echo provider: reconstruction must reproduce the source byte-for-byte.
    let provider = Arc::new(MockProvider::with_handler(|request| {
        MockOutcome::text(request.messages.last().unwrap().content.clone())
    }));

    fixture
        .runner(provider)
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(&output).unwrap(), content);
}

// ── Orchestration errors ──────────────────────────────────────────────────────

#[tokio::test]
async fn missing_profile_aborts_the_run() {
    let fixture = Fixture::new().with_base_profiles();
    let store = hibiki_profile::ProfileStore::new(fixture.profiles_dir());
    let err = PipelineRunner::load(store, "nonexistent").unwrap_err();
    assert!(matches!(err, RunError::MissingProfile(_)));
}

#[tokio::test]
async fn missing_referenced_profile_aborts_the_run() {
    let fixture = Fixture::new().with_base_profiles();
    fixture.write_profile(
        "pipeline",
        "broken",
        "id: broken\nprovider: remote\nprompt: missing-prompt\nparser: plain\nchunk_policy: per-line\n",
    );
    let input = fixture.write_input("in.txt", "hello\n");

    let store = hibiki_profile::ProfileStore::new(fixture.profiles_dir());
    let runner = PipelineRunner::load(store, "broken")
        .unwrap()
        .with_provider(hello_world_provider());
    let err = runner.run(&input, RunOptions::default()).await.unwrap_err();
    assert!(matches!(err, RunError::MissingProfile(_)));
}

#[tokio::test]
async fn missing_input_file_is_an_input_error() {
    let fixture = Fixture::new().with_base_profiles();
    let runner = fixture.runner(hello_world_provider());
    let err = runner
        .run(Path::new("/no/such/input.txt"), RunOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Input(_)));
}

// ── Pre rules shape prompts, not comparisons ──────────────────────────────────

#[tokio::test]
async fn pre_rules_transform_prompt_source_only() {
    let fixture = Fixture::new();
    fixture.write_profile("prompt", "raw", "id: raw\n");
    fixture.write_profile("parser", "plain", "id: plain\ntype: plain\n");
    fixture.write_profile(
        "chunk",
        "per-line",
        "id: per-line\nchunk_type: line\noptions:\n  keep_empty: true\n",
    );
    fixture.write_profile(
        "pipeline",
        "main",
        concat!(
            "id: main\nprovider: remote\nprompt: raw\nparser: plain\nchunk_policy: per-line\n",
            "settings:\n  max_retries: 0\n  concurrency: 1\n",
            "processing:\n  rules_pre:\n    - type: replace\n      pattern: secret\n      replacement: REDACTED\n",
        ),
    );
    let input = fixture.write_input("in.txt", "a secret line\n");
    let output = fixture.dir.path().join("out.txt");

    let provider = Arc::new(MockProvider::with_handler(|request| {
        let content = &request.messages.last().unwrap().content;
        assert!(
            content.contains("REDACTED"),
            "pre rule did not reach the prompt: {content}"
        );
        MockOutcome::text("translated")
    }));

    fixture
        .runner(provider)
        .run(
            &input,
            RunOptions {
                output_path: Some(output.clone()),
                save_cache: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read_to_string(&output).unwrap(), "translated\n");
}
