// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sandboxed user script rules.
//!
//! A `script` rule carries a user-supplied Python `transform` function.  The
//! source is validated here before anything runs: size cap, `transform`
//! presence, import whitelist (`re` only), and a ban on dunder names and
//! dangerous calls.  Valid scripts execute in an isolated `python3`
//! subprocess whose harness installs a minimal builtins table and enforces a
//! 0.5 s wall-clock deadline on the call.  Every failure mode (validation,
//! missing interpreter, runtime error, timeout) records `last_error` and
//! leaves the text untouched.

use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use regex::Regex;
use serde_json::json;
use tracing::warn;

pub const SCRIPT_MAX_LEN: usize = 8000;
pub const SCRIPT_TIMEOUT: Duration = Duration::from_millis(500);

const BANNED_CALLS: &[&str] = &[
    "eval", "exec", "compile", "open", "__import__", "input", "globals", "locals", "vars", "dir",
    "getattr", "setattr", "delattr",
];

/// Subprocess harness.  Reads `{script, text, src_text}` JSON on stdin,
/// executes `transform` under a restricted builtins table with its own
/// deadline thread, and writes `{ok, value}` or `{ok: false, error}` JSON on
/// stdout.
const HARNESS: &str = r#"
import json, re, sys, threading

payload = json.loads(sys.stdin.read())
script = payload["script"]
text = payload["text"]
src_text = payload.get("src_text")

def _safe_import(name, *args, **kwargs):
    if name == "re":
        return re
    raise ImportError("Only 're' import is allowed")

SAFE_BUILTINS = {
    "len": len, "range": range, "min": min, "max": max, "sum": sum,
    "str": str, "int": int, "float": float, "bool": bool,
    "list": list, "dict": dict, "set": set, "tuple": tuple,
    "enumerate": enumerate, "zip": zip, "sorted": sorted,
    "abs": abs, "round": round, "__import__": _safe_import,
}

result = {"ok": False, "error": "unknown"}

def run():
    global result
    try:
        scope = {"__builtins__": SAFE_BUILTINS, "re": re}
        exec(script, scope, scope)
        func = scope.get("transform")
        if not callable(func):
            result = {"ok": False, "error": "Missing transform() definition"}
            return
        try:
            value = func(text, src_text)
        except TypeError:
            value = func(text)
        result = {"ok": True, "value": "" if value is None else str(value)}
    except Exception as e:
        result = {"ok": False, "error": "Runtime error: %s" % e}

worker = threading.Thread(target=run, daemon=True)
worker.start()
worker.join(0.5)
if worker.is_alive():
    sys.stdout.write(json.dumps({"ok": False, "error": "Timeout after 0.5s"}))
    sys.stdout.flush()
    import os
    os._exit(0)
sys.stdout.write(json.dumps(result, ensure_ascii=False))
"#;

/// Static validation of a script source.  Rejection reasons mirror the
/// sandbox contract; validation runs before any interpreter is involved.
pub fn validate_script(source: &str) -> Result<(), String> {
    if source.trim().is_empty() {
        return Err("Empty script".to_string());
    }
    if source.chars().count() > SCRIPT_MAX_LEN {
        return Err(format!("Script too long (max {SCRIPT_MAX_LEN} chars)"));
    }

    let import_re = Regex::new(r"(?m)^\s*(?:import|from)\s+([A-Za-z_][A-Za-z0-9_.]*)").unwrap();
    for caps in import_re.captures_iter(source) {
        let module = caps.get(1).unwrap().as_str();
        if module != "re" {
            return Err("Only 're' import is allowed".to_string());
        }
    }

    let dunder_re = Regex::new(r"__[A-Za-z0-9_]+").unwrap();
    if dunder_re.is_match(source) {
        return Err("Dunder names are not allowed".to_string());
    }

    let banned = BANNED_CALLS.join("|");
    let call_re = Regex::new(&format!(r"\b(?:{banned})\s*\(")).unwrap();
    if let Some(m) = call_re.find(source) {
        let name = m.as_str().trim_end_matches(['(', ' ', '\t']);
        return Err(format!("Call blocked: {name}"));
    }

    let transform_re = Regex::new(r"(?m)^\s*def\s+transform\s*\(").unwrap();
    if !transform_re.is_match(source) {
        return Err("Missing transform() definition".to_string());
    }
    Ok(())
}

pub struct ScriptRule {
    source: String,
    validation_error: Option<String>,
    last_error: Mutex<Option<String>>,
}

impl ScriptRule {
    pub fn new(source: String) -> Self {
        let validation_error = validate_script(&source).err();
        if let Some(error) = &validation_error {
            warn!(error = %error, "script rule blocked");
        }
        Self {
            source,
            validation_error,
            last_error: Mutex::new(None),
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().unwrap().clone()
    }

    fn record_error(&self, error: impl Into<String>) {
        let error = error.into();
        let mut last = self.last_error.lock().unwrap();
        if last.as_deref() != Some(error.as_str()) {
            // Log once per distinct failure; repeats stay silent.
            warn!(error = %error, "script rule failed; treating as no-op");
        }
        *last = Some(error);
    }

    /// Run the script over `text`.  Any failure leaves the text untouched.
    pub fn apply(&self, text: &str, src_text: Option<&str>) -> String {
        if let Some(error) = &self.validation_error {
            self.record_error(error.clone());
            return text.to_string();
        }
        match self.run_subprocess(text, src_text) {
            Ok(value) => {
                *self.last_error.lock().unwrap() = None;
                value
            }
            Err(error) => {
                self.record_error(error);
                text.to_string()
            }
        }
    }

    fn run_subprocess(&self, text: &str, src_text: Option<&str>) -> Result<String, String> {
        let payload = json!({
            "script": self.source,
            "text": text,
            "src_text": src_text,
        });

        let mut child = Command::new("python3")
            .arg("-c")
            .arg(HARNESS)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("interpreter unavailable: {e}"))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.to_string().as_bytes())
                .map_err(|e| format!("failed to feed script harness: {e}"))?;
        }

        // The harness enforces the 0.5 s transform deadline itself; this
        // outer deadline only covers interpreter startup and a wedged runtime.
        let outer_deadline = Instant::now() + SCRIPT_TIMEOUT + Duration::from_secs(5);
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) => {
                    if Instant::now() >= outer_deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(format!("Timeout after {}s", SCRIPT_TIMEOUT.as_secs_f32()));
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(format!("script harness failed: {e}")),
            }
        }

        let output = child
            .wait_with_output()
            .map_err(|e| format!("script harness failed: {e}"))?;
        let reply: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|_| "script harness produced no result".to_string())?;
        if reply["ok"].as_bool() == Some(true) {
            Ok(reply["value"].as_str().unwrap_or_default().to_string())
        } else {
            Err(reply["error"]
                .as_str()
                .unwrap_or("unknown script error")
                .to_string())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
