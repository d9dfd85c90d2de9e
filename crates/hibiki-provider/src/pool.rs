// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Weighted pool over multiple OpenAI-compatible endpoints.
//!
//! `build_request` picks an endpoint by weighted random selection and stamps
//! the request with `provider_id = "endpoint:<index>"`; `send` honours the
//! stamp so retries of the same request hit the same endpoint.  Endpoint
//! profiles inherit pool-level `api_key`/`model`/`headers`/`params`/
//! `timeout`/`rpm` as fallbacks.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;

use hibiki_profile::{lenient_f64, ApiProfile, EndpointProfile, Settings};

use crate::{
    Message, OpenAiCompatProvider, Provider, ProviderError, ProviderRequest, ProviderResponse,
};

#[derive(Debug)]
struct Endpoint {
    id: String,
    label: String,
    provider: OpenAiCompatProvider,
}

#[derive(Debug)]
pub struct PoolProvider {
    profile: ApiProfile,
    endpoints: Vec<Endpoint>,
    weights: Vec<f64>,
}

/// Non-positive / non-finite weights coerce to 1.0.
fn normalize_weight(raw: Option<&serde_yaml::Value>) -> f64 {
    let weight = raw.and_then(lenient_f64).unwrap_or(1.0);
    if weight.is_finite() && weight > 0.0 {
        weight
    } else {
        1.0
    }
}

impl PoolProvider {
    pub fn new(profile: ApiProfile) -> Result<Self, ProviderError> {
        let mut endpoints = Vec::new();
        let mut weights = Vec::new();
        for item in &profile.endpoints {
            let base_url = item.base_url.trim();
            if base_url.is_empty() {
                continue;
            }
            let index = endpoints.len();
            let id = item
                .id
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("endpoint_{}", index + 1));
            let label = item
                .label
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| id.clone());
            let endpoint_profile = build_endpoint_profile(&profile, item, &id);
            weights.push(normalize_weight(item.weight.as_ref()));
            endpoints.push(Endpoint {
                id,
                label,
                provider: OpenAiCompatProvider::new(endpoint_profile)?,
            });
        }
        if endpoints.is_empty() {
            return Err(ProviderError::EmptyPool);
        }
        Ok(Self {
            profile,
            endpoints,
            weights,
        })
    }

    fn pick_endpoint_index(&self) -> usize {
        let total: f64 = self.weights.iter().sum();
        let mut roll = rand::thread_rng().gen_range(0.0..total);
        for (idx, weight) in self.weights.iter().enumerate() {
            if roll < *weight {
                return idx;
            }
            roll -= weight;
        }
        self.weights.len() - 1
    }

    fn endpoint_from_request(&self, request: &ProviderRequest) -> Option<usize> {
        let provider_id = request.provider_id.as_deref()?;
        let idx: usize = provider_id.strip_prefix("endpoint:")?.parse().ok()?;
        (idx < self.endpoints.len()).then_some(idx)
    }

    fn attach_endpoint_meta(&self, request: &mut ProviderRequest, idx: usize) {
        let endpoint = &self.endpoints[idx];
        request.provider_id = Some(format!("endpoint:{idx}"));
        request.meta.insert("endpoint_index".into(), json!(idx));
        request.meta.insert("endpoint_id".into(), json!(endpoint.id));
        request
            .meta
            .insert("endpoint_label".into(), json!(endpoint.label));
    }
}

/// Pool-level fields act as endpoint fallbacks.
fn build_endpoint_profile(pool: &ApiProfile, endpoint: &EndpointProfile, id: &str) -> ApiProfile {
    ApiProfile {
        id: format!("{}:{}", pool.id, id),
        name: None,
        api_type: Some("openai_compat".into()),
        base_url: Some(endpoint.base_url.trim().to_string()),
        model: endpoint.model.clone().or_else(|| pool.model.clone()),
        api_key: endpoint.api_key.clone().or_else(|| pool.api_key.clone()),
        headers: pool.headers.clone(),
        params: pool.params.clone(),
        rpm: endpoint.rpm.clone().or_else(|| pool.rpm.clone()),
        timeout: pool.timeout.clone(),
        max_retries: pool.max_retries.clone(),
        concurrency: pool.concurrency.clone(),
        endpoints: Vec::new(),
    }
}

#[async_trait]
impl Provider for PoolProvider {
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
        let idx = self.pick_endpoint_index();
        let mut request = self.endpoints[idx].provider.build_request(messages, settings)?;
        self.attach_endpoint_meta(&mut request, idx);
        Ok(request)
    }

    async fn send(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let idx = self
            .endpoint_from_request(request)
            .unwrap_or_else(|| self.pick_endpoint_index());
        let endpoint = &self.endpoints[idx];
        let mut response = endpoint.provider.send(request).await?;
        if response.raw.get("pool").is_none() {
            response.raw["pool"] = json!({
                "endpoint_index": idx,
                "endpoint_id": endpoint.id,
                "endpoint_label": endpoint.label,
            });
        }
        Ok(response)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_profile(yaml: &str) -> ApiProfile {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = PoolProvider::new(pool_profile("id: p\ntype: pool")).unwrap_err();
        assert!(matches!(err, ProviderError::EmptyPool));

        // Endpoints without a base_url are skipped, so this is empty too.
        let err = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nendpoints:\n  - model: m",
        ))
        .unwrap_err();
        assert!(matches!(err, ProviderError::EmptyPool));
    }

    #[test]
    fn weights_coerce_nonpositive_to_one() {
        assert_eq!(normalize_weight(None), 1.0);
        assert_eq!(
            normalize_weight(Some(&serde_yaml::from_str("-2").unwrap())),
            1.0
        );
        assert_eq!(
            normalize_weight(Some(&serde_yaml::from_str("0").unwrap())),
            1.0
        );
        assert_eq!(
            normalize_weight(Some(&serde_yaml::from_str(".nan").unwrap())),
            1.0
        );
        assert_eq!(
            normalize_weight(Some(&serde_yaml::from_str("2.5").unwrap())),
            2.5
        );
    }

    #[test]
    fn default_endpoint_ids_and_labels() {
        let pool = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nmodel: shared\nendpoints:\n  - base_url: http://a\n  - base_url: http://b\n    id: special\n    label: Fast one",
        ))
        .unwrap();
        assert_eq!(pool.endpoints[0].id, "endpoint_1");
        assert_eq!(pool.endpoints[0].label, "endpoint_1");
        assert_eq!(pool.endpoints[1].id, "special");
        assert_eq!(pool.endpoints[1].label, "Fast one");
    }

    #[test]
    fn endpoints_inherit_pool_model_and_key() {
        let pool = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nmodel: shared\napi_key: K\nendpoints:\n  - base_url: http://a\n  - base_url: http://b\n    model: own",
        ))
        .unwrap();
        assert_eq!(
            pool.endpoints[0].provider.profile().model.as_deref(),
            Some("shared")
        );
        assert_eq!(
            pool.endpoints[1].provider.profile().model.as_deref(),
            Some("own")
        );
    }

    #[test]
    fn build_request_stamps_endpoint_identity() {
        let pool = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nmodel: m\nendpoints:\n  - base_url: http://a",
        ))
        .unwrap();
        let req = pool
            .build_request(&[Message::user("hi")], &Settings::default())
            .unwrap();
        assert_eq!(req.provider_id.as_deref(), Some("endpoint:0"));
        assert_eq!(req.meta.get("endpoint_id").unwrap(), "endpoint_1");
        assert_eq!(req.meta.get("endpoint_index").unwrap(), 0);
    }

    #[test]
    fn stamped_index_is_honoured() {
        let pool = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nmodel: m\nendpoints:\n  - base_url: http://a\n  - base_url: http://b",
        ))
        .unwrap();
        let mut req = ProviderRequest {
            provider_id: Some("endpoint:1".into()),
            ..Default::default()
        };
        assert_eq!(pool.endpoint_from_request(&req), Some(1));
        req.provider_id = Some("endpoint:99".into());
        assert_eq!(pool.endpoint_from_request(&req), None);
        req.provider_id = Some("garbage".into());
        assert_eq!(pool.endpoint_from_request(&req), None);
    }

    #[test]
    fn weighted_pick_prefers_heavy_endpoint() {
        let pool = PoolProvider::new(pool_profile(
            "id: p\ntype: pool\nmodel: m\nendpoints:\n  - base_url: http://a\n    weight: 99\n  - base_url: http://b\n    weight: 1",
        ))
        .unwrap();
        let heavy = (0..200)
            .filter(|_| pool.pick_endpoint_index() == 0)
            .count();
        assert!(heavy > 150, "heavy endpoint picked only {heavy}/200 times");
    }
}
