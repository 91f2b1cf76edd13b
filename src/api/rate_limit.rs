//! Rate-limit middleware, response headers, and the status endpoint.
//!
//! Runs after authentication: the principal picks the tier (anonymous or
//! authenticated) and the bucket key. A denied request answers
//! `429 Too Many Requests` with a JSON body and never reaches the handler;
//! an admitted request gets its classification attached for the classifier
//! call. The `X-RateLimit-*` header set is emitted on every response,
//! allowed or denied.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{SecondsFormat, Utc};
use serde_json::json;

use crate::{
    error::ApiError,
    gateway::GatewayState,
    identity::Principal,
    limiter::{Decision, DenyReason, LimitTier},
};

pub(crate) fn tier_for(principal: &Principal) -> LimitTier {
    if principal.anonymous {
        LimitTier::Anonymous
    } else {
        LimitTier::Authenticated
    }
}

/// Axum middleware enforcing per-principal rate limits.
pub async fn rate_limit_middleware(
    State(state): State<Arc<GatewayState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        return ApiError::Internal(anyhow::anyhow!("rate limiter invoked without principal"))
            .into_response();
    };

    let tier = tier_for(&principal);
    let key = principal.bucket_key();
    let decision = state.limiter.admit(&key, tier, Utc::now());

    if let Some(reason) = decision.denied {
        tracing::warn!(
            principal = %key,
            reason = reason.as_str(),
            retry_after = decision.retry_after_secs,
            "request denied by rate limiter"
        );
        let mut response = deny_response(reason, &decision);
        apply_headers(response.headers_mut(), &decision);
        return response;
    }

    debug_assert!(decision.allowed());
    req.extensions_mut().insert(decision.classification);
    let mut response = next.run(req).await;
    apply_headers(response.headers_mut(), &decision);
    response
}

/// `GET /v1/rate-limit-status` — current counters without incrementing usage.
pub async fn rate_limit_status(
    State(state): State<Arc<GatewayState>>,
    Extension(principal): Extension<Principal>,
) -> Json<serde_json::Value> {
    let tier = tier_for(&principal);
    let snapshot = state
        .limiter
        .peek(&principal.bucket_key(), tier, Utc::now());
    let limits = state.limiter.tier_limits(tier);

    Json(json!({
        "tier": tier.to_string(),
        "daily": {
            "limit": snapshot.limit_day,
            "used": snapshot.used_day,
            "remaining": snapshot.remaining_day,
            "reset_time": snapshot.reset_day.to_rfc3339_opts(SecondsFormat::Secs, true),
        },
        "minute": {
            "limit": snapshot.limit_minute,
            "remaining": snapshot.remaining_minute,
            "reset_time": snapshot.reset_minute.to_rfc3339_opts(SecondsFormat::Secs, true),
        },
        "blocked_until": snapshot
            .blocked_until
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true)),
        "suspicious_config": {
            "threshold": limits.suspicious_threshold,
            "window_seconds": limits.suspicious_window_secs,
            "block_duration_seconds": limits.block_duration_secs,
        },
    }))
}

fn deny_response(reason: DenyReason, decision: &Decision) -> Response {
    let mut body = json!({
        "error": deny_message(reason),
        "code": "RATE_LIMIT_EXCEEDED",
        "reason": reason.as_str(),
        "retry_after_seconds": decision.retry_after_secs,
    });
    match reason {
        DenyReason::Suspicious => {
            if let Some(until) = decision.snapshot.blocked_until {
                body["blocked_until"] =
                    json!(until.to_rfc3339_opts(SecondsFormat::Secs, true));
            }
        }
        DenyReason::MinuteLimit => {
            body["reset_time"] = json!(decision
                .snapshot
                .reset_minute
                .to_rfc3339_opts(SecondsFormat::Secs, true));
        }
        DenyReason::DailyExhausted => {
            body["reset_time"] = json!(decision
                .snapshot
                .reset_day
                .to_rfc3339_opts(SecondsFormat::Secs, true));
        }
    }

    (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response()
}

fn deny_message(reason: DenyReason) -> &'static str {
    match reason {
        DenyReason::Suspicious => "Temporarily blocked for suspicious activity.",
        DenyReason::MinuteLimit => "Too many requests this minute. Slow down.",
        DenyReason::DailyExhausted => "Daily request limit reached.",
    }
}

fn status_message(decision: &Decision) -> &'static str {
    match decision.denied {
        Some(DenyReason::Suspicious) => "blocked for suspicious activity",
        Some(DenyReason::MinuteLimit) => "minute limit exceeded",
        Some(DenyReason::DailyExhausted) => "daily limit exhausted",
        None => match decision.classification {
            crate::limiter::Classification::Pro => "ok",
            crate::limiter::Classification::Free => "daily quota spent, serving as free",
        },
    }
}

/// Emit the `X-RateLimit-*` header set on every response.
fn apply_headers(headers: &mut HeaderMap, decision: &Decision) {
    let snap = &decision.snapshot;
    let pairs: Vec<(&str, String)> = vec![
        ("x-ratelimit-limit", snap.limit_day.to_string()),
        ("x-ratelimit-remaining", snap.remaining_day.to_string()),
        ("x-ratelimit-reset", snap.reset_day.timestamp().to_string()),
        ("x-ratelimit-limit-minute", snap.limit_minute.to_string()),
        (
            "x-ratelimit-remaining-minute",
            snap.remaining_minute.to_string(),
        ),
        (
            "x-ratelimit-reset-minute",
            snap.reset_minute.timestamp().to_string(),
        ),
        (
            "x-request-type",
            decision.classification.header_value().to_owned(),
        ),
        ("x-ratelimit-used", snap.used_day.to_string()),
        ("x-ratelimit-status", status_message(decision).to_owned()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    }
    if let Some(reason) = decision.denied {
        headers.insert("x-ratelimit-blocked", HeaderValue::from_static("true"));
        if let Ok(value) = HeaderValue::from_str(reason.as_str()) {
            headers.insert("x-ratelimit-block-reason", value);
        }
    }
}
