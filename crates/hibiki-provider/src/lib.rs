// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Remote chat-completion providers.
//!
//! Two provider shapes speak the same `/chat/completions` wire format: a
//! single OpenAI-compatible endpoint and a weighted pool of them.  Both are
//! configured through an `api` profile and constructed with [`from_profile`].
//!
//! A request is built once per block from merged pipeline/profile settings;
//! the retry loop re-sends the *same* request, so a pool-stamped endpoint
//! stays pinned across retries.

pub mod mock;
mod openai_compat;
mod pool;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use hibiki_profile::{ApiProfile, Settings};

pub use openai_compat::{build_chat_url, normalize_base_url, OpenAiCompatProvider, RpmLimiter};
pub use pool::PoolProvider;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Stop sequences injected when the caller does not specify `stop`.  Only the
/// first four are sent for OpenAI/Volcengine compatibility.
pub const DEFAULT_STOP_TOKENS: &[&str] = &[
    "<|im_end|>",     // ChatML
    "<|endoftext|>",  // GPT/Base
    "</s>",           // Llama 2 / Mistral
    "<|eot_id|>",     // Llama 3
    "<|end_of_text|>", // Llama 3 Base
    "\n\n\n",         // Heuristic safety net
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// A fully merged request, ready to send.
#[derive(Debug, Clone, Default)]
pub struct ProviderRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Extra body keys merged verbatim (profile params < settings params).
    pub extra: serde_json::Map<String, serde_json::Value>,
    pub headers: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    /// Pool endpoint stamp (`endpoint:<index>`); retries honour it.
    pub provider_id: Option<String>,
    pub meta: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// The assistant-content string.
    pub text: String,
    /// Decoded response body plus decoration (`data`, `duration_ms`, `pool`).
    pub raw: serde_json::Value,
    pub status_code: Option<u16>,
    pub duration_ms: Option<u64>,
    pub url: Option<String>,
}

impl ProviderResponse {
    /// `(input_tokens, output_tokens)` from the response usage object.
    pub fn token_usage(&self) -> (u64, u64) {
        let usage = &self.raw["data"]["usage"];
        (
            usage["prompt_tokens"].as_u64().unwrap_or(0),
            usage["completion_tokens"].as_u64().unwrap_or(0),
        )
    }
}

/// Provider failures.  The Display strings are load-bearing: the adaptive
/// controller classifies them by message (`HTTP 429`, `5xx`, `timed out`) and
/// the runner extracts status codes from `HTTP (\d{3})`.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider requires a model (settings.model or api profile model)")]
    MissingModel,
    #[error("provider requires base_url")]
    MissingBaseUrl,
    #[error("pool provider requires endpoints")]
    EmptyPool,
    #[error("unsupported provider type: {0}")]
    UnsupportedType(String),
    #[error("request failed: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("response is not JSON: {0}")]
    InvalidJson(String),
    #[error("response missing choices[0].message.content")]
    MissingContent,
    #[error("request cancelled")]
    Cancelled,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Profile id, used in diagnostics and as the cache model-name fallback.
    fn id(&self) -> &str;

    /// The api profile this provider was built from.  The runner reads the
    /// `model`, `max_retries`, and `concurrency` fallbacks from here.
    fn profile(&self) -> &ApiProfile;

    /// Merge pipeline settings with the profile into a sendable request.
    fn build_request(
        &self,
        messages: &[Message],
        settings: &Settings,
    ) -> Result<ProviderRequest, ProviderError>;

    /// Send one request.  Blocks on the RPM limiter and network I/O, bounded
    /// by the per-request timeout.
    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

/// Construct a provider from its `api` profile.
pub fn from_profile(profile: &ApiProfile) -> Result<Box<dyn Provider>, ProviderError> {
    match profile.api_type() {
        "openai_compat" => Ok(Box::new(OpenAiCompatProvider::new(profile.clone())?)),
        "pool" => Ok(Box::new(PoolProvider::new(profile.clone())?)),
        other => Err(ProviderError::UnsupportedType(other.to_string())),
    }
}

/// Convert a YAML value into its JSON equivalent (profile `params` blocks are
/// merged into JSON request bodies).  Non-string mapping keys are rendered
/// with their YAML display form.
pub fn yaml_to_json(value: &serde_yaml::Value) -> serde_json::Value {
    match value {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                serde_json::Value::from(i)
            } else if let Some(u) = n.as_u64() {
                serde_json::Value::from(u)
            } else {
                n.as_f64()
                    .and_then(serde_json::Number::from_f64)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null)
            }
        }
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => {
            serde_json::Value::Array(seq.iter().map(yaml_to_json).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = k
                    .as_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| serde_yaml::to_string(k).unwrap_or_default().trim().to_string());
                out.insert(key, yaml_to_json(v));
            }
            serde_json::Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => yaml_to_json(&tagged.value),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
