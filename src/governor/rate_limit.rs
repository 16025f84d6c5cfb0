//! Per-identity sliding rate limits.
//!
//! Two token buckets per identity (per-minute and per-hour) with lazy
//! refill: tokens accrue continuously as a function of elapsed time, capped
//! at the window capacity, and are recomputed on access rather than by a
//! background timer. A call is admitted only when *both* windows have a
//! token, and consumes from both atomically under the identity's entry
//! lock, so the check can never admit a call that only one window allows.

use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::config::RateConfig;

/// The rate window that rejected a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RateWindow {
    /// The per-minute window.
    Minute,
    /// The per-hour window.
    Hour,
}

impl std::fmt::Display for RateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minute => f.write_str("minute"),
            Self::Hour => f.write_str("hour"),
        }
    }
}

/// Verdict of a rate check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateVerdict {
    /// Both windows had capacity; one token was consumed from each.
    Allowed,
    /// A window was empty. Nothing was consumed from either window.
    Limited {
        /// The first window found empty (minute is checked first).
        window: RateWindow,
        /// Configured capacity of that window.
        limit: u32,
        /// Seconds until one token accrues in that window.
        retry_after_secs: u64,
    },
}

/// One lazily-refilled token bucket.
#[derive(Debug, Clone)]
struct Bucket {
    /// Current token count; fractional so refill is continuous.
    tokens: f64,
    /// Maximum token count.
    capacity: f64,
    /// Tokens accrued per second.
    refill_per_sec: f64,
    /// Instant of the last refill computation.
    refreshed_at: Instant,
}

impl Bucket {
    fn new(capacity: u32, window_secs: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec: capacity / window_secs,
            refreshed_at: now,
        }
    }

    /// Bring the token count up to date for the given instant.
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refreshed_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.refreshed_at = now;
    }

    fn has_token(&self) -> bool {
        self.tokens >= 1.0
    }

    fn consume(&mut self) {
        self.tokens -= 1.0;
    }

    /// Seconds until at least one token is available, rounded up.
    fn retry_after_secs(&self) -> u64 {
        if self.has_token() {
            return 0;
        }
        if self.refill_per_sec <= 0.0 {
            return u64::MAX;
        }
        ((1.0 - self.tokens) / self.refill_per_sec).ceil() as u64
    }
}

/// Both buckets for one identity.
#[derive(Debug, Clone)]
struct IdentityBuckets {
    minute: Bucket,
    hour: Bucket,
}

/// Point-in-time view of an identity's remaining capacity.
#[derive(Debug, Clone, Serialize)]
pub struct RateUsage {
    /// Whole tokens remaining in the per-minute window.
    pub minute_remaining: u32,
    /// Configured per-minute capacity.
    pub minute_limit: u32,
    /// Whole tokens remaining in the per-hour window.
    pub hour_remaining: u32,
    /// Configured per-hour capacity.
    pub hour_limit: u32,
}

/// Per-identity dual-window rate limiter.
///
/// Identities are independent: admitting or rejecting one never affects
/// another. Buckets are created on first sight of an identity, full.
pub struct RateLimiter {
    buckets: DashMap<String, IdentityBuckets>,
    per_minute: u32,
    per_hour: u32,
}

impl RateLimiter {
    /// Create a limiter with the configured window capacities.
    pub fn new(config: &RateConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            per_minute: config.per_minute,
            per_hour: config.per_hour,
        }
    }

    /// Check both windows for `identity` and consume one token from each if
    /// both allow. Check-and-consume is atomic per identity: the entry lock
    /// is held across both windows.
    pub fn check(&self, identity: &str) -> RateVerdict {
        self.check_at(identity, Instant::now())
    }

    /// [`check`](Self::check) at an explicit instant.
    pub(crate) fn check_at(&self, identity: &str, now: Instant) -> RateVerdict {
        let mut entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| IdentityBuckets {
                minute: Bucket::new(self.per_minute, 60.0, now),
                hour: Bucket::new(self.per_hour, 3600.0, now),
            });

        entry.minute.refill(now);
        entry.hour.refill(now);

        if !entry.minute.has_token() {
            let retry = entry.minute.retry_after_secs();
            debug!(identity, window = "minute", retry_after_secs = retry, "rate limited");
            return RateVerdict::Limited {
                window: RateWindow::Minute,
                limit: self.per_minute,
                retry_after_secs: retry,
            };
        }
        if !entry.hour.has_token() {
            let retry = entry.hour.retry_after_secs();
            debug!(identity, window = "hour", retry_after_secs = retry, "rate limited");
            return RateVerdict::Limited {
                window: RateWindow::Hour,
                limit: self.per_hour,
                retry_after_secs: retry,
            };
        }

        entry.minute.consume();
        entry.hour.consume();
        RateVerdict::Allowed
    }

    /// Snapshot the remaining capacity for an identity without consuming.
    pub fn usage(&self, identity: &str) -> RateUsage {
        self.usage_at(identity, Instant::now())
    }

    pub(crate) fn usage_at(&self, identity: &str, now: Instant) -> RateUsage {
        match self.buckets.get_mut(identity) {
            Some(mut entry) => {
                entry.minute.refill(now);
                entry.hour.refill(now);
                RateUsage {
                    minute_remaining: entry.minute.tokens.floor() as u32,
                    minute_limit: self.per_minute,
                    hour_remaining: entry.hour.tokens.floor() as u32,
                    hour_limit: self.per_hour,
                }
            }
            None => RateUsage {
                minute_remaining: self.per_minute,
                minute_limit: self.per_minute,
                hour_remaining: self.per_hour,
                hour_limit: self.per_hour,
            },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
