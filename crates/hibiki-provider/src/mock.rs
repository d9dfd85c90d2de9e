// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Deterministic mock providers for tests.
//!
//! `MockProvider::scripted` pops pre-programmed outcomes per call (ordered
//! runs); `MockProvider::with_handler` routes on the request itself, which is
//! what concurrent runs need to stay deterministic.  The last request is
//! recorded so tests can inspect exactly what was sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use hibiki_profile::{ApiProfile, Settings};

use crate::{Message, Provider, ProviderError, ProviderRequest, ProviderResponse};

/// One scripted outcome: a reply, or a failure with an optional HTTP status.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Text(String),
    Fail { status: Option<u16>, message: String },
}

impl MockOutcome {
    pub fn text(s: impl Into<String>) -> Self {
        MockOutcome::Text(s.into())
    }

    pub fn http(status: u16, message: impl Into<String>) -> Self {
        MockOutcome::Fail {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        MockOutcome::Fail {
            status: None,
            message: message.into(),
        }
    }
}

type Handler = dyn Fn(&ProviderRequest) -> MockOutcome + Send + Sync;

enum Behavior {
    Scripted(Mutex<VecDeque<MockOutcome>>),
    Handler(Box<Handler>),
}

pub struct MockProvider {
    profile: ApiProfile,
    behavior: Behavior,
    calls: AtomicUsize,
    /// The last `ProviderRequest` seen, for test inspection.
    pub last_request: Mutex<Option<ProviderRequest>>,
}

impl MockProvider {
    fn base(behavior: Behavior) -> Self {
        Self {
            profile: ApiProfile {
                id: "mock".into(),
                model: Some("mock-model".into()),
                ..Default::default()
            },
            behavior,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    /// Pop outcomes front-to-back; repeats the last text when exhausted.
    pub fn scripted(outcomes: Vec<MockOutcome>) -> Self {
        Self::base(Behavior::Scripted(Mutex::new(outcomes.into())))
    }

    /// Always reply with the same text.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let reply = reply.into();
        Self::with_handler(move |_| MockOutcome::Text(reply.clone()))
    }

    /// Route each request through a handler (deterministic under concurrency).
    pub fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(&ProviderRequest) -> MockOutcome + Send + Sync + 'static,
    {
        Self::base(Behavior::Handler(Box::new(handler)))
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Provider for MockProvider {
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
        Ok(ProviderRequest {
            model: settings
                .model
                .clone()
                .unwrap_or_else(|| "mock-model".to_string()),
            messages: messages.to_vec(),
            ..Default::default()
        })
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        let outcome = match &self.behavior {
            Behavior::Scripted(scripts) => {
                let mut scripts = scripts.lock().unwrap();
                if scripts.len() > 1 {
                    scripts.pop_front().unwrap()
                } else {
                    scripts
                        .front()
                        .cloned()
                        .unwrap_or_else(|| MockOutcome::text("[no more scripts]"))
                }
            }
            Behavior::Handler(handler) => handler(request),
        };
        match outcome {
            MockOutcome::Text(text) => Ok(ProviderResponse {
                raw: json!({
                    "data": {"usage": {"prompt_tokens": 10, "completion_tokens": 10}},
                }),
                text,
                status_code: Some(200),
                duration_ms: Some(1),
                url: None,
            }),
            MockOutcome::Fail {
                status: Some(status),
                message,
            } => Err(ProviderError::Http {
                status,
                body: message,
            }),
            MockOutcome::Fail {
                status: None,
                message,
            } => Err(ProviderError::Network(message)),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
