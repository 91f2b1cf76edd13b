//! Classifier client — ranks candidate models for a prompt.
//!
//! One synchronous JSON round-trip per completion request, wrapped in the
//! process-wide circuit breaker. The classifier receives the prompt plus the
//! request classification (`max` for pro-quota requests, `free` otherwise)
//! and answers with primary/secondary/default model ids and a score map
//! carrying per-model provider metadata.
//!
//! The call has a hard deadline; reqwest cancels the in-flight request when
//! it elapses, so a slow classifier cannot leak connections.

use std::{collections::HashSet, sync::Arc};

use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::{
    breaker::{BreakerError, CircuitBreaker},
    config::{ClassifierConfig, Provider},
    limiter::Classification,
    providers::Candidate,
};

#[derive(Debug, Error)]
pub enum ClassifierError {
    /// Circuit open, transport failure, non-2xx, or an unreadable response.
    #[error("classifier unavailable")]
    Unavailable,
    /// The deadline elapsed before the classifier answered.
    #[error("classifier timed out")]
    Timeout,
}

/// Ranked response from the classifier.
#[derive(Debug, Clone, Deserialize)]
pub struct RankedModels {
    #[serde(default)]
    pub primary_model: String,
    #[serde(default)]
    pub secondary_model: String,
    #[serde(default)]
    pub default_model: String,
    #[serde(default)]
    pub metadata: Option<ClassifierMetadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClassifierMetadata {
    #[serde(default)]
    pub model_scores: std::collections::HashMap<String, ModelScore>,
}

/// Per-model metadata from the score map. Extra fields are ignored; the
/// provider arrives as a string so a single unknown provider degrades to a
/// skipped candidate instead of failing the whole response.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelScore {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub provider_model_name: Option<String>,
    #[serde(default)]
    pub is_thinking_model: bool,
}

impl RankedModels {
    /// Ordered, deduplicated candidate list: primary, secondary, default.
    ///
    /// Ids without a usable score entry are skipped. Empty when the
    /// classifier sent no metadata; the caller then falls back to the
    /// configured default model.
    pub fn candidates(&self) -> Vec<Candidate> {
        let Some(metadata) = &self.metadata else {
            return Vec::new();
        };

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for id in [&self.primary_model, &self.secondary_model, &self.default_model] {
            if id.is_empty() || !seen.insert(id.as_str()) {
                continue;
            }
            let Some(score) = metadata.model_scores.get(id.as_str()) else {
                continue;
            };
            let Some(provider) = parse_provider(&score.provider) else {
                tracing::warn!(model = %id, provider = %score.provider, "unknown provider in classifier response");
                continue;
            };
            out.push(Candidate {
                model_id: id.clone(),
                provider,
                display_name: score.display_name.clone().unwrap_or_else(|| id.clone()),
                provider_model_name: score
                    .provider_model_name
                    .clone()
                    .unwrap_or_else(|| id.clone()),
                is_thinking_model: score.is_thinking_model,
            });
        }
        out
    }
}

fn parse_provider(raw: &str) -> Option<Provider> {
    match raw {
        "gemini" => Some(Provider::Gemini),
        "openrouter" => Some(Provider::OpenRouter),
        "groq" => Some(Provider::Groq),
        "local" => Some(Provider::Local),
        _ => None,
    }
}

#[derive(Debug, Error)]
enum CallError {
    #[error("classifier request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("classifier returned HTTP {0}")]
    Status(StatusCode),
    #[error("classifier response malformed: {0}")]
    Malformed(#[source] reqwest::Error),
}

pub struct ClassifierClient {
    client: reqwest::Client,
    url: String,
    breaker: Arc<CircuitBreaker>,
}

impl ClassifierClient {
    pub fn new(cfg: &ClassifierConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.timeout())
            .build()
            .expect("failed to build classifier client");
        Self {
            client,
            url: cfg.url.clone(),
            breaker,
        }
    }

    /// Rank models for `prompt` under breaker protection.
    pub async fn rank(
        &self,
        prompt: &str,
        classification: Classification,
    ) -> Result<RankedModels, ClassifierError> {
        let result = self.breaker.execute(self.call(prompt, classification)).await;
        match result {
            Ok(ranked) => Ok(ranked),
            Err(BreakerError::Open) => Err(ClassifierError::Unavailable),
            Err(BreakerError::Inner(CallError::Http(err))) if err.is_timeout() => {
                Err(ClassifierError::Timeout)
            }
            Err(BreakerError::Inner(err)) => {
                tracing::warn!(error = %err, "classifier call failed");
                Err(ClassifierError::Unavailable)
            }
        }
    }

    async fn call(
        &self,
        prompt: &str,
        classification: Classification,
    ) -> Result<RankedModels, CallError> {
        let body = json!({
            "prompt": prompt,
            "request_type": classification.request_type(),
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(CallError::Http)?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Status(status));
        }

        response.json().await.map_err(CallError::Malformed)
    }
}
