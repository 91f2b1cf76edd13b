//! Shared gateway state and the streaming fallback orchestrator.
//!
//! [`GatewayState`] owns every process-wide singleton: the rate limiter, the
//! classifier client and its circuit breaker, one adapter per configured
//! provider, the repository handle, and the request log. It is injected into
//! every handler via [`axum::extract::State`].
//!
//! The orchestrator drives the ranked candidate list in order. A candidate
//! that fails **before** the first SSE frame reaches the client is swallowed
//! and the next candidate is tried; once any frame has been flushed the
//! stream is committed and failures are terminal. The whole stream runs
//! under a ten-minute deadline derived from the request.

use std::{collections::HashMap, convert::Infallible, sync::Arc, time::Duration};

use axum::{
    body::Body,
    http::header,
    response::Response,
};
use tokio::sync::mpsc;

use crate::{
    breaker::CircuitBreaker,
    classifier::ClassifierClient,
    config::{Config, Provider},
    error::MODELS_UNAVAILABLE,
    identity::TokenVerifier,
    limiter::{Classification, RateLimiter},
    providers::{Candidate, Conversation, ProviderClient},
    repository::ChatRepository,
    sse::{SseSink, StreamEvent},
    traffic::{CompletionRecord, RequestLog},
};

/// Hard ceiling on one streaming response.
pub const STREAM_DEADLINE: Duration = Duration::from_secs(600);

/// Process-wide shared state.
pub struct GatewayState {
    pub config: Arc<Config>,
    pub limiter: RateLimiter,
    pub breaker: Arc<CircuitBreaker>,
    pub classifier: ClassifierClient,
    providers: HashMap<Provider, ProviderClient>,
    pub chats: Arc<dyn ChatRepository>,
    pub traffic: Arc<RequestLog>,
    verifier: tokio::sync::OnceCell<Arc<TokenVerifier>>,
}

impl GatewayState {
    pub fn new(config: Arc<Config>, chats: Arc<dyn ChatRepository>) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));
        let classifier = ClassifierClient::new(&config.classifier, Arc::clone(&breaker));
        let providers = config
            .providers
            .iter()
            .map(|(provider, cfg)| (*provider, ProviderClient::new(*provider, cfg)))
            .collect();
        Self {
            limiter: RateLimiter::new(config.limits.clone()),
            breaker,
            classifier,
            providers,
            chats,
            traffic: Arc::new(RequestLog::new(RequestLog::DEFAULT_CAPACITY)),
            verifier: tokio::sync::OnceCell::new(),
            config,
        }
    }

    /// Identity verifier, initialized on first use.
    ///
    /// Initialization failure surfaces to the caller (a 500) and is retried
    /// on the next request rather than poisoning the process.
    pub async fn verifier(&self) -> anyhow::Result<Arc<TokenVerifier>> {
        self.verifier
            .get_or_try_init(|| async { TokenVerifier::from_config(&self.config.identity).map(Arc::new) })
            .await
            .cloned()
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderClient> {
        self.providers.get(&provider)
    }

    /// Candidate used when the classifier answered without model metadata.
    pub fn fallback_candidate(&self) -> Candidate {
        let fallback = &self.config.fallback;
        let model = self
            .config
            .provider(fallback.provider)
            .map(|cfg| cfg.model.clone())
            .unwrap_or_default();
        Candidate {
            model_id: model.clone(),
            provider: fallback.provider,
            display_name: fallback.display_name.clone(),
            provider_model_name: model,
            is_thinking_model: false,
        }
    }
}

/// Request-scoped fields threaded through the orchestrator for logging.
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub request_id: String,
    pub principal: String,
    pub classification: Classification,
}

/// Open the SSE response and drive the candidates on a background task.
///
/// The response headers go out as soon as axum polls the body, so by the
/// time the first candidate is contacted the status line is already
/// committed; provider failures surface as SSE `error` events, never as a
/// late status change.
pub fn stream_completion(
    state: Arc<GatewayState>,
    ctx: StreamContext,
    candidates: Vec<Candidate>,
    conversation: Conversation,
) -> Response {
    let (mut sink, rx) = SseSink::channel();

    tokio::spawn(async move {
        let deadline = tokio::time::timeout(
            STREAM_DEADLINE,
            drive(&state, &ctx, &candidates, &conversation, &mut sink),
        )
        .await;
        if deadline.is_err() {
            tracing::warn!(
                request_id = %ctx.request_id,
                principal = %ctx.principal,
                "stream deadline exceeded"
            );
            let _ = sink.send(&StreamEvent::error("stream deadline exceeded")).await;
        }
    });

    sse_response(rx)
}

/// Assemble the SSE response around a frame channel.
fn sse_response(rx: mpsc::Receiver<bytes::Bytes>) -> Response {
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|frame| (Ok::<_, Infallible>(frame), rx))
    });

    Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .expect("static SSE headers are valid")
}

/// Try each candidate in rank order until one commits the stream.
async fn drive(
    state: &GatewayState,
    ctx: &StreamContext,
    candidates: &[Candidate],
    conversation: &Conversation,
    sink: &mut SseSink,
) {
    let started = std::time::Instant::now();

    for (rank, candidate) in candidates.iter().enumerate() {
        let Some(client) = state.provider(candidate.provider) else {
            tracing::warn!(
                request_id = %ctx.request_id,
                provider = %candidate.provider,
                "provider not configured — skipping candidate"
            );
            continue;
        };

        match client.stream(candidate, conversation, sink).await {
            Ok(()) => {
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    request_id = %ctx.request_id,
                    principal = %ctx.principal,
                    provider = %candidate.provider,
                    model = %candidate.model_id,
                    duration_ms,
                    "stream completed"
                );
                let mut record =
                    CompletionRecord::new(&ctx.request_id, &ctx.principal, duration_ms, true)
                        .with_provider(&candidate.provider.to_string(), &candidate.model_id)
                        .with_classification(ctx.classification.header_value());
                if rank > 0 {
                    record = record.mark_fell_back();
                }
                state.traffic.push(record);
                return;
            }
            Err(err) if !sink.first_byte_emitted() => {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    principal = %ctx.principal,
                    provider = %candidate.provider,
                    status = provider_status(&err),
                    error = %err,
                    "provider failed before first byte — trying next candidate"
                );
            }
            Err(err) => {
                // Bytes already reached the client; the adapter has emitted
                // the terminal event where one was still possible.
                let duration_ms = started.elapsed().as_millis() as u64;
                tracing::error!(
                    request_id = %ctx.request_id,
                    principal = %ctx.principal,
                    provider = %candidate.provider,
                    status = provider_status(&err),
                    duration_ms,
                    error = %err,
                    "stream failed mid-flight"
                );
                state.traffic.push(
                    CompletionRecord::new(&ctx.request_id, &ctx.principal, duration_ms, false)
                        .with_provider(&candidate.provider.to_string(), &candidate.model_id)
                        .with_classification(ctx.classification.header_value())
                        .with_error(&err.to_string()),
                );
                return;
            }
        }
    }

    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::error!(
        request_id = %ctx.request_id,
        principal = %ctx.principal,
        duration_ms,
        candidates = candidates.len(),
        "all providers failed before first byte"
    );
    let _ = sink.send(&StreamEvent::error(MODELS_UNAVAILABLE)).await;
    state.traffic.push(
        CompletionRecord::new(&ctx.request_id, &ctx.principal, duration_ms, false)
            .with_classification(ctx.classification.header_value())
            .with_error("all providers failed"),
    );
}

fn provider_status(err: &crate::providers::ProviderError) -> Option<u16> {
    match err {
        crate::providers::ProviderError::Status { status, .. } => Some(status.as_u16()),
        _ => None,
    }
}
