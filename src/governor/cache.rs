//! TTL response cache keyed by request fingerprint.
//!
//! The fingerprint is a SHA-256 over the provider id and the canonical JSON
//! serialization of the request, so two semantically identical requests hit
//! the same entry regardless of construction order. Expired entries are
//! reaped lazily on lookup; a hit returns a deep copy of the stored
//! response so callers cannot mutate cached state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::CacheConfig;
use crate::provider::{ProviderId, ProviderRequest, ProviderResult};

/// Stable cache key for a provider request.
///
/// Returns an error string only if the request fails to serialize, which
/// cannot happen for the closed request type; callers treat it as a miss.
pub fn fingerprint(provider: ProviderId, request: &ProviderRequest) -> Option<String> {
    let body = serde_json::to_string(request).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(provider.as_str().as_bytes());
    hasher.update(b"\x00");
    hasher.update(body.as_bytes());
    Some(hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone)]
struct CacheEntry {
    result: ProviderResult,
    stored_at: Instant,
    hit_count: u64,
}

/// Hit/miss counters since process start.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    /// Lookups served from the cache.
    pub hits: u64,
    /// Lookups that went to a provider.
    pub misses: u64,
    /// Live entries right now.
    pub entries: u64,
}

/// Bounded TTL cache for provider responses.
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ResponseCache {
    /// Create a cache with the configured TTL and capacity.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            ttl: Duration::from_secs(config.ttl_secs),
            max_entries: config.max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Look up a fingerprint. Expired entries are removed on sight and
    /// count as misses.
    pub fn get(&self, key: &str) -> Option<ProviderResult> {
        self.get_at(key, Instant::now())
    }

    pub(crate) fn get_at(&self, key: &str, now: Instant) -> Option<ProviderResult> {
        let expired = {
            match self.entries.get_mut(key) {
                Some(mut entry) => {
                    if now.saturating_duration_since(entry.stored_at) < self.ttl {
                        entry.hit_count += 1;
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.result.clone());
                    }
                    true
                }
                None => false,
            }
            // guard dropped here; removal below must not hold it
        };
        if expired {
            self.entries.remove(key);
            debug!(key, "expired cache entry evicted");
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a response under a fingerprint. At capacity, one arbitrary
    /// entry is evicted to make room; the cache bounds memory, it does not
    /// promise LRU.
    pub fn put(&self, key: String, result: ProviderResult) {
        self.put_at(key, result, Instant::now());
    }

    pub(crate) fn put_at(&self, key: String, result: ProviderResult, now: Instant) {
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(&key) {
            let victim = self.entries.iter().next().map(|e| e.key().clone());
            if let Some(victim) = victim {
                self.entries.remove(&victim);
                debug!(key = victim, "cache at capacity, evicted one entry");
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: now,
                hit_count: 0,
            },
        );
    }

    /// How many times a live entry has been served. `None` when absent.
    pub fn hit_count(&self, key: &str) -> Option<u64> {
        self.entries.get(key).map(|e| e.hit_count)
    }

    /// Counters since process start.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len() as u64,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
