//! Per-principal rate limiting with suspicious-burst protection.
//!
//! Every principal maps to one [`UsageRecord`] bucket keyed `anon:<uid>` or
//! `user:<uid>`. A bucket tracks a daily counter (reset at local midnight), a
//! per-minute counter (reset at the next minute boundary), the timestamps of
//! recent hits for burst detection, and an optional temporary block.
//!
//! Admission is a single read-modify-write on one key, evaluated under that
//! bucket's exclusive lock (the [`DashMap`] shard lock), so updates are
//! linearizable per key. The whole check is parameterised on `now`, which
//! keeps the window arithmetic testable without sleeping.
//!
//! Two tiers ship built in: **anonymous** (small lifetime daily cap, hard
//! deny once spent) and **authenticated** (larger cap, requests past it
//! degrade to the free classification instead of being denied).

use std::collections::VecDeque;

use chrono::{DateTime, Duration, DurationRound, Local, TimeZone, Utc};
use dashmap::DashMap;
use serde::Serialize;

use crate::config::{LimitsConfig, TierLimits};

/// Rate-limit policy class for a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitTier {
    Anonymous,
    Authenticated,
}

impl std::fmt::Display for LimitTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anonymous => "anonymous",
            Self::Authenticated => "authenticated",
        })
    }
}

/// Whether an admitted request still counts against the premium daily quota.
///
/// Propagated to the classifier so it ranks models appropriately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Pro,
    Free,
}

impl Classification {
    /// Value for the `X-Request-Type` response header.
    pub fn header_value(self) -> &'static str {
        match self {
            Self::Pro => "pro",
            Self::Free => "free",
        }
    }

    /// Value for the classifier's `request_type` field.
    pub fn request_type(self) -> &'static str {
        match self {
            Self::Pro => "max",
            Self::Free => "free",
        }
    }
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    Suspicious,
    MinuteLimit,
    DailyExhausted,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspicious => "suspicious",
            Self::MinuteLimit => "minute_limit",
            Self::DailyExhausted => "daily_exhausted",
        }
    }
}

/// One principal's usage bucket.
#[derive(Debug, Clone)]
struct UsageRecord {
    day_count: u32,
    day_reset_at: DateTime<Utc>,
    minute_count: u32,
    minute_reset_at: DateTime<Utc>,
    recent_hits: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
}

impl UsageRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            day_count: 0,
            day_reset_at: next_local_midnight(now),
            minute_count: 0,
            minute_reset_at: next_minute_boundary(now),
            recent_hits: VecDeque::new(),
            blocked_until: None,
        }
    }

    /// Roll the daily / minute windows forward if they have elapsed.
    fn roll_windows(&mut self, now: DateTime<Utc>) {
        if now >= self.day_reset_at {
            self.day_count = 0;
            self.day_reset_at = next_local_midnight(now);
            self.recent_hits.clear();
        }
        if now >= self.minute_reset_at {
            self.minute_count = 0;
            self.minute_reset_at = next_minute_boundary(now);
        }
    }
}

/// Counter snapshot taken at decision time; drives the response headers and
/// the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UsageSnapshot {
    pub limit_day: u32,
    pub remaining_day: u32,
    pub reset_day: DateTime<Utc>,
    pub limit_minute: u32,
    pub remaining_minute: u32,
    pub reset_minute: DateTime<Utc>,
    pub used_day: u32,
    pub blocked_until: Option<DateTime<Utc>>,
}

/// Outcome of one admission check.
#[derive(Debug, Clone)]
pub struct Decision {
    pub denied: Option<DenyReason>,
    pub classification: Classification,
    pub snapshot: UsageSnapshot,
    /// Seconds until the relevant window reopens; meaningful on deny.
    pub retry_after_secs: i64,
}

impl Decision {
    pub fn allowed(&self) -> bool {
        self.denied.is_none()
    }
}

/// Process-wide limiter: one bucket per principal key.
pub struct RateLimiter {
    buckets: DashMap<String, UsageRecord>,
    limits: LimitsConfig,
}

impl RateLimiter {
    pub fn new(limits: LimitsConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            limits,
        }
    }

    pub fn tier_limits(&self, tier: LimitTier) -> &TierLimits {
        match tier {
            LimitTier::Anonymous => &self.limits.anonymous,
            LimitTier::Authenticated => &self.limits.authenticated,
        }
    }

    /// Admission check: deny/allow plus the counter snapshot for headers.
    ///
    /// Buckets are created lazily on first hit. The entire sequence runs
    /// under the bucket's exclusive lock.
    pub fn admit(&self, key: &str, tier: LimitTier, now: DateTime<Utc>) -> Decision {
        let cfg = self.tier_limits(tier).clone();
        let mut entry = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| UsageRecord::new(now));
        let rec = entry.value_mut();

        // An active block denies everything; an expired one is cleared.
        if let Some(until) = rec.blocked_until {
            if until > now {
                return deny(rec, &cfg, DenyReason::Suspicious, until - now);
            }
            rec.blocked_until = None;
        }

        rec.roll_windows(now);

        if rec.minute_count >= cfg.requests_per_minute {
            let wait = rec.minute_reset_at - now;
            return deny(rec, &cfg, DenyReason::MinuteLimit, wait);
        }

        if cfg.hard_daily_cap && rec.day_count >= cfg.requests_per_day {
            let wait = rec.day_reset_at - now;
            return deny(rec, &cfg, DenyReason::DailyExhausted, wait);
        }

        rec.recent_hits.push_back(now);
        let tracking_cutoff = now - cfg.tracking_window();
        while rec
            .recent_hits
            .front()
            .is_some_and(|t| *t < tracking_cutoff)
        {
            rec.recent_hits.pop_front();
        }

        let window_start = now - cfg.suspicious_window();
        let burst = rec.recent_hits.iter().filter(|t| **t > window_start).count();
        if burst > cfg.suspicious_threshold {
            rec.blocked_until = Some(now + cfg.block_duration());
            tracing::warn!(key, hits = burst, "suspicious burst — key blocked");
            return deny(rec, &cfg, DenyReason::Suspicious, cfg.block_duration());
        }

        rec.day_count += 1;
        rec.minute_count += 1;

        let classification = if rec.day_count <= cfg.requests_per_day {
            Classification::Pro
        } else {
            Classification::Free
        };

        Decision {
            denied: None,
            classification,
            snapshot: snapshot(rec, &cfg),
            retry_after_secs: 0,
        }
    }

    /// Read-only view for the status endpoint; never increments usage.
    pub fn peek(&self, key: &str, tier: LimitTier, now: DateTime<Utc>) -> UsageSnapshot {
        let cfg = self.tier_limits(tier);
        match self.buckets.get(key) {
            Some(entry) => {
                // Roll windows on a copy so observation stays side-effect free.
                let mut rec = entry.value().clone();
                drop(entry);
                if rec.blocked_until.is_some_and(|until| until <= now) {
                    rec.blocked_until = None;
                }
                rec.roll_windows(now);
                snapshot(&rec, cfg)
            }
            None => snapshot(&UsageRecord::new(now), cfg),
        }
    }

    /// Drop buckets idle past their tier's cleanup TTL. Returns the number
    /// of buckets removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.buckets.len();
        self.buckets.retain(|key, rec| {
            let ttl = if key.starts_with("anon:") {
                self.limits.anonymous.cleanup_ttl()
            } else {
                self.limits.authenticated.cleanup_ttl()
            };
            now.signed_duration_since(rec.day_reset_at) <= ttl
        });
        before - self.buckets.len()
    }

    /// Live bucket count, for the metrics endpoint.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Smallest configured sweep cadence across tiers.
    pub fn cleanup_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.limits
                .anonymous
                .cleanup_interval_secs
                .min(self.limits.authenticated.cleanup_interval_secs),
        )
    }
}

fn deny(rec: &UsageRecord, cfg: &TierLimits, reason: DenyReason, wait: Duration) -> Decision {
    Decision {
        denied: Some(reason),
        classification: Classification::Free,
        snapshot: snapshot(rec, cfg),
        retry_after_secs: wait.num_seconds().max(1),
    }
}

fn snapshot(rec: &UsageRecord, cfg: &TierLimits) -> UsageSnapshot {
    UsageSnapshot {
        limit_day: cfg.requests_per_day,
        remaining_day: cfg.requests_per_day.saturating_sub(rec.day_count),
        reset_day: rec.day_reset_at,
        limit_minute: cfg.requests_per_minute,
        remaining_minute: cfg.requests_per_minute.saturating_sub(rec.minute_count),
        reset_minute: rec.minute_reset_at,
        used_day: rec.day_count,
        blocked_until: rec.blocked_until,
    }
}

/// Next local midnight strictly after `now`.
fn next_local_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let local = now.with_timezone(&Local);
    let next_day = local.date_naive().succ_opt().expect("date overflow");
    let midnight = next_day.and_hms_opt(0, 0, 0).expect("valid midnight");
    match Local.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) => {
            dt.with_timezone(&Utc)
        }
        // DST gap at midnight: fall forward one hour.
        chrono::LocalResult::None => (midnight + Duration::hours(1))
            .and_local_timezone(Local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now + Duration::days(1)),
    }
}

/// Next minute boundary strictly after `now`.
fn next_minute_boundary(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(Duration::minutes(1))
        .expect("minute truncation cannot fail")
        + Duration::minutes(1)
}
