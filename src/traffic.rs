//! In-memory log of recent completion requests.
//!
//! [`RequestLog`] is a fixed-capacity ring-buffer: once full, the oldest
//! record is evicted to make room for the newest. This gives a bounded, O(1)
//! memory footprint regardless of request volume. The `/metrics` endpoint
//! derives its counters from this window.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

/// Fixed-capacity ring-buffer of recent [`CompletionRecord`]s.
///
/// Safe to share across tasks via `Arc<RequestLog>`. [`push`][Self::push]
/// uses a non-blocking `try_lock` so it never delays the streaming path; in
/// the unlikely event of lock contention the record is silently dropped.
pub struct RequestLog {
    capacity: usize,
    entries: Mutex<VecDeque<CompletionRecord>>,
}

impl RequestLog {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Record a finished completion request. Best-effort and non-blocking.
    pub fn push(&self, record: CompletionRecord) {
        if let Ok(mut entries) = self.entries.try_lock() {
            if entries.len() == self.capacity {
                entries.pop_front();
            }
            entries.push_back(record);
        }
    }

    /// Return up to `limit` recent records, newest first.
    pub async fn recent(&self, limit: usize) -> Vec<CompletionRecord> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }
}

/// One completed (or failed) streaming request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRecord {
    /// Request ID shared with the `X-Request-ID` header and the logs.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Principal uid, prefixed the same way as the rate-limit bucket key.
    pub principal: String,
    /// Provider that produced the client-visible bytes, if any did.
    pub provider: Option<String>,
    pub model: Option<String>,
    /// `pro` or `free`, as attached by the rate limiter.
    pub classification: Option<String>,
    /// Whether a lower-ranked candidate ended up serving the request.
    pub fell_back: bool,
    pub duration_ms: u64,
    pub success: bool,
    pub error: Option<String>,
}

impl CompletionRecord {
    pub fn new(request_id: &str, principal: &str, duration_ms: u64, success: bool) -> Self {
        Self {
            request_id: request_id.to_owned(),
            timestamp: Utc::now(),
            principal: principal.to_owned(),
            provider: None,
            model: None,
            classification: None,
            fell_back: false,
            duration_ms,
            success,
            error: None,
        }
    }

    pub fn with_provider(mut self, provider: &str, model: &str) -> Self {
        self.provider = Some(provider.to_owned());
        self.model = Some(model.to_owned());
        self
    }

    pub fn with_classification(mut self, classification: &str) -> Self {
        self.classification = Some(classification.to_owned());
        self
    }

    pub fn mark_fell_back(mut self) -> Self {
        self.fell_back = true;
        self
    }

    pub fn with_error(mut self, err: &str) -> Self {
        self.error = Some(err.to_owned());
        self
    }
}
