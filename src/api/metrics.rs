//! Prometheus-compatible `/metrics` endpoint.
//!
//! Request metrics are derived from the in-memory ring-buffer window.
//! Because the buffer has a fixed capacity, values represent a **sliding
//! window** of recent requests rather than lifetime counters. Use
//! `TYPE gauge` throughout for semantic accuracy; values may decrease as
//! old entries rotate out.
//!
//! Metric families:
//! - `sg_window_size`       — records currently in the ring buffer
//! - `sg_requests`          — per-provider/outcome request counts
//! - `sg_duration_ms_sum`   — sum of stream durations per provider (for avg)
//! - `sg_duration_ms_count` — denominator matching the sum above
//! - `sg_fallbacks_total`   — requests served by a lower-ranked candidate
//! - `sg_errors_total`      — requests that ended in an error
//! - `sg_rate_limit_buckets`— live rate-limit buckets
//! - `sg_breaker_state`     — classifier breaker (0 closed, 1 half-open, 2 open)

use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
};

use crate::{breaker::BreakerState, gateway::GatewayState};

/// `GET /metrics` — renders Prometheus text format.
pub async fn metrics(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let entries = state.traffic.recent(usize::MAX).await;

    let window_size = entries.len();
    let mut fallbacks: u64 = 0;
    let mut errors: u64 = 0;

    // (provider, success) → count
    let mut request_counts: HashMap<(String, bool), u64> = HashMap::new();
    // provider → (duration_sum_ms, count)
    let mut durations: HashMap<String, (u64, u64)> = HashMap::new();

    for entry in &entries {
        if entry.fell_back {
            fallbacks += 1;
        }
        if !entry.success {
            errors += 1;
        }

        let provider = entry.provider.clone().unwrap_or_else(|| "none".to_owned());
        *request_counts
            .entry((provider.clone(), entry.success))
            .or_default() += 1;

        let duration = durations.entry(provider).or_default();
        duration.0 += entry.duration_ms;
        duration.1 += 1;
    }

    let mut out = String::with_capacity(1024);

    out.push_str("# HELP sg_window_size Number of requests currently held in the ring-buffer window.\n");
    out.push_str("# TYPE sg_window_size gauge\n");
    out.push_str(&format!("sg_window_size {window_size}\n\n"));

    out.push_str("# HELP sg_requests Request count in the current window, labelled by provider and outcome.\n");
    out.push_str("# TYPE sg_requests gauge\n");
    let mut request_rows: Vec<_> = request_counts.iter().collect();
    request_rows.sort_by(|a, b| a.0.cmp(b.0));
    for ((provider, success), count) in request_rows {
        let success_str = if *success { "true" } else { "false" };
        out.push_str(&format!(
            "sg_requests{{provider=\"{provider}\",success=\"{success_str}\"}} {count}\n"
        ));
    }
    out.push('\n');

    out.push_str("# HELP sg_duration_ms_sum Sum of stream duration (ms) in the current window, grouped by provider.\n");
    out.push_str("# TYPE sg_duration_ms_sum gauge\n");
    out.push_str("# HELP sg_duration_ms_count Number of observations for the duration sum above.\n");
    out.push_str("# TYPE sg_duration_ms_count gauge\n");
    let mut duration_rows: Vec<_> = durations.iter().collect();
    duration_rows.sort_by(|a, b| a.0.cmp(b.0));
    for (provider, (sum, count)) in duration_rows {
        out.push_str(&format!("sg_duration_ms_sum{{provider=\"{provider}\"}} {sum}\n"));
        out.push_str(&format!("sg_duration_ms_count{{provider=\"{provider}\"}} {count}\n"));
    }
    out.push('\n');

    out.push_str("# HELP sg_fallbacks_total Requests served by a lower-ranked candidate in the current window.\n");
    out.push_str("# TYPE sg_fallbacks_total gauge\n");
    out.push_str(&format!("sg_fallbacks_total {fallbacks}\n\n"));

    out.push_str("# HELP sg_errors_total Requests that ended in an error in the current window.\n");
    out.push_str("# TYPE sg_errors_total gauge\n");
    out.push_str(&format!("sg_errors_total {errors}\n\n"));

    out.push_str("# HELP sg_rate_limit_buckets Live rate-limit buckets.\n");
    out.push_str("# TYPE sg_rate_limit_buckets gauge\n");
    out.push_str(&format!(
        "sg_rate_limit_buckets {}\n\n",
        state.limiter.bucket_count()
    ));

    let breaker_value = match state.breaker.state() {
        BreakerState::Closed => 0,
        BreakerState::HalfOpen => 1,
        BreakerState::Open => 2,
    };
    out.push_str("# HELP sg_breaker_state Classifier circuit breaker state (0 closed, 1 half-open, 2 open).\n");
    out.push_str("# TYPE sg_breaker_state gauge\n");
    out.push_str(&format!("sg_breaker_state {breaker_value}\n"));

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        out,
    )
}
