// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI-compatible chat completion provider.
//!
//! POSTs `/v1/chat/completions` with a JSON body and `Authorization: Bearer`
//! auth.  Handles the messy parts of user-supplied endpoints: base-URL
//! normalisation, multi-key round-robin rotation, and a fixed-spacing
//! requests-per-minute limiter shared by all workers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use tracing::debug;

use hibiki_profile::{lenient_f64, lenient_u64, ApiProfile, Settings};

use crate::{
    yaml_to_json, Message, Provider, ProviderError, ProviderRequest, ProviderResponse,
    DEFAULT_STOP_TOKENS, DEFAULT_TIMEOUT,
};

/// Normalise a user-supplied base URL to the prefix `/chat/completions` is
/// appended to:
///
/// - `…/v1/chat/completions` → trimmed back to `…/v1`
/// - bare host (no path) → `<host>/v1`
/// - path ending `/v1`, containing a `/v<digits>` segment, or an `/openapi`
///   gateway prefix → kept verbatim
/// - any other explicit path (private reverse proxies) → kept verbatim
pub fn normalize_base_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return String::new();
    }
    if let Some(prefix) = base.strip_suffix("/chat/completions") {
        if prefix.ends_with("/v1") {
            return prefix.to_string();
        }
    }

    let path = url_path(base).to_ascii_lowercase();
    let version_segment = Regex::new(r"/v\d+(?:/|$)").unwrap();
    if path.is_empty()
        || path == "/"
        || path.ends_with("/v1")
        || version_segment.is_match(&path)
        || path.contains("/openapi")
    {
        if !path.is_empty() && path != "/" {
            return base.to_string();
        }
        return format!("{base}/v1");
    }
    base.to_string()
}

/// Full chat-completions URL for a base.  A base that already names the
/// complete endpoint is used as-is; `/chat/completions` is appended exactly
/// once otherwise.
pub fn build_chat_url(base_url: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return String::new();
    }
    if base.ends_with("/chat/completions") {
        return base.to_string();
    }
    format!("{}/chat/completions", normalize_base_url(base))
}

/// Path component of a URL, without any URL-crate dependency: everything from
/// the first `/` after the scheme+authority.
fn url_path(url: &str) -> &str {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };
    match rest.find('/') {
        Some(pos) => &rest[pos..],
        None => "",
    }
}

/// Fixed-spacing request scheduler: one slot every `60/rpm` seconds.  The
/// mutex only advances the slot cursor; the sleep happens outside it so the
/// limiter never serialises the waiting itself.
#[derive(Debug)]
pub struct RpmLimiter {
    interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RpmLimiter {
    /// `rpm ≤ 0` disables the limiter (returns `None`).
    pub fn new(rpm: i64) -> Option<Self> {
        if rpm <= 0 {
            return None;
        }
        Some(Self {
            interval: Duration::from_secs_f64(60.0 / rpm as f64),
            next_slot: Mutex::new(Instant::now()),
        })
    }

    /// Block the caller until the next request slot.
    pub async fn acquire(&self) {
        let wait = {
            let mut slot = self.next_slot.lock().unwrap();
            let now = Instant::now();
            let scheduled = (*slot).max(now);
            *slot = scheduled + self.interval;
            scheduled.saturating_duration_since(now)
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// `api_key` may be one string, a newline-separated string, or a list.
fn normalize_keys(raw: Option<&serde_yaml::Value>) -> Vec<String> {
    match raw {
        None | Some(serde_yaml::Value::Null) => Vec::new(),
        Some(serde_yaml::Value::Sequence(seq)) => seq
            .iter()
            .filter_map(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Some(serde_yaml::Value::String(s)) => s
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect(),
        Some(other) => {
            let rendered = serde_yaml::to_string(other)
                .unwrap_or_default()
                .trim()
                .to_string();
            if rendered.is_empty() {
                Vec::new()
            } else {
                vec![rendered]
            }
        }
    }
}

#[derive(Debug)]
pub struct OpenAiCompatProvider {
    profile: ApiProfile,
    api_keys: Vec<String>,
    /// Round-robin cursor; only consulted when more than one key is present.
    key_cursor: Mutex<usize>,
    limiter: Option<RpmLimiter>,
    client: reqwest::Client,
}

impl OpenAiCompatProvider {
    pub fn new(profile: ApiProfile) -> Result<Self, ProviderError> {
        let api_keys = normalize_keys(profile.api_key.as_ref());
        let rpm = profile
            .rpm
            .as_ref()
            .and_then(hibiki_profile::lenient_i64)
            .unwrap_or(0);
        Ok(Self {
            api_keys,
            key_cursor: Mutex::new(0),
            limiter: RpmLimiter::new(rpm),
            client: reqwest::Client::new(),
            profile,
        })
    }

    fn pick_api_key(&self) -> String {
        if self.api_keys.is_empty() {
            return String::new();
        }
        if self.api_keys.len() == 1 {
            return self.api_keys[0].clone();
        }
        let mut cursor = self.key_cursor.lock().unwrap();
        let key = self.api_keys[*cursor].clone();
        *cursor = (*cursor + 1) % self.api_keys.len();
        key
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn id(&self) -> &str {
        &self.profile.id
    }

    fn profile(&self) -> &ApiProfile {
        &self.profile
    }

    fn build_request(
        &self,
        messages: &[Message],
        settings: &Settings,
    ) -> Result<ProviderRequest, ProviderError> {
        let model = settings
            .model
            .as_deref()
            .or(self.profile.model.as_deref())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .ok_or(ProviderError::MissingModel)?
            .to_string();

        let temperature = settings.temperature.as_ref().and_then(lenient_f64);
        let max_tokens = settings.max_tokens.as_ref().and_then(lenient_u64);

        let mut extra = serde_json::Map::new();
        if let Some(params) = &self.profile.params {
            for (k, v) in params {
                if let Some(key) = k.as_str() {
                    extra.insert(key.to_string(), yaml_to_json(v));
                }
            }
        }
        if let Some(params) = &settings.params {
            for (k, v) in params {
                if let Some(key) = k.as_str() {
                    extra.insert(key.to_string(), yaml_to_json(v));
                }
            }
        }
        if !extra.contains_key("stop") {
            // Max 4 items for OpenAI/Volcengine compatibility.
            extra.insert("stop".to_string(), json!(DEFAULT_STOP_TOKENS[..4]));
        }

        let mut headers = std::collections::BTreeMap::new();
        if let Some(profile_headers) = &self.profile.headers {
            headers.extend(profile_headers.clone());
        }
        if let Some(settings_headers) = &settings.headers {
            headers.extend(settings_headers.clone());
        }

        let timeout = settings
            .timeout
            .as_ref()
            .and_then(lenient_u64)
            .or_else(|| self.profile.timeout.as_ref().and_then(lenient_u64))
            .map(Duration::from_secs);

        Ok(ProviderRequest {
            model,
            messages: messages.to_vec(),
            temperature,
            max_tokens,
            extra,
            headers,
            timeout,
            provider_id: None,
            meta: Default::default(),
        })
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let base_url = self
            .profile
            .base_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or(ProviderError::MissingBaseUrl)?;

        if let Some(limiter) = &self.limiter {
            limiter.acquire().await;
        }

        let url = build_chat_url(base_url);
        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut payload = json!({
            "model": request.model,
            "messages": messages,
        });
        for (k, v) in &request.extra {
            payload[k.as_str()] = v.clone();
        }
        if let Some(t) = request.temperature {
            payload["temperature"] = json!(t);
        }
        if let Some(m) = request.max_tokens {
            payload["max_tokens"] = json!(m);
        }

        let mut http = self
            .client
            .post(&url)
            .timeout(request.timeout.unwrap_or(DEFAULT_TIMEOUT))
            .json(&payload);
        let api_key = self.pick_api_key();
        if !api_key.is_empty() {
            http = http.bearer_auth(&api_key);
        }
        for (name, value) in &request.headers {
            http = http.header(name.as_str(), value.as_str());
        }

        debug!(url = %url, model = %request.model, messages = request.messages.len(), "sending completion request");

        let start = Instant::now();
        let resp = http
            .send()
            .await
            .map_err(|e| ProviderError::Network(e.to_string()))?;
        let status = resp.status().as_u16();
        let duration_ms = start.elapsed().as_millis() as u64;

        if status >= 400 {
            let body = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Http { status, body });
        }

        let data: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ProviderError::InvalidJson(e.to_string()))?;
        let text = data["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(ProviderError::MissingContent)?
            .to_string();

        Ok(ProviderResponse {
            text,
            raw: json!({"data": data, "duration_ms": duration_ms}),
            status_code: Some(status),
            duration_ms: Some(duration_ms),
            url: Some(url),
        })
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
