//! Adaptive-exploration signal source.
//!
//! A short HTTP GET with a per-call timeout and a TTL cache of the last good
//! value. Failure never blocks decisions: on timeout or error the source
//! reports *unavailable* and the strategist falls back to base ε.

use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Deserialize)]
struct SignalBody {
    /// Scalar in [0, 1]; higher means exploit more.
    signal: f64,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct SignalStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub errors: u64,
    pub hit_rate: f64,
    pub cache_age_ms: Option<u64>,
    pub configured: bool,
}

struct CacheSlot {
    fetched_at: Instant,
    value: f64,
}

/// Cached client for the adaptive-exploration source.
pub struct SignalSource {
    url: Option<String>,
    ttl: Duration,
    client: reqwest::Client,
    cache: RwLock<Option<CacheSlot>>,
    hits: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

impl SignalSource {
    pub fn new(url: Option<String>, timeout: Duration, ttl: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction");
        Self {
            url,
            ttl,
            client,
            cache: RwLock::new(None),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    /// Disabled source: always unavailable.
    pub fn disabled() -> Self {
        Self::new(None, Duration::from_millis(1), Duration::from_secs(1))
    }

    /// Sample the signal. `None` means unavailable; callers proceed with
    /// base ε. Serves a fresh cached value without a network round trip, and
    /// falls back to the stale last-good value on fetch failure.
    pub async fn sample(&self) -> Option<f64> {
        let url = self.url.as_ref()?;

        if let Some(slot) = self.cache.read().as_ref() {
            if slot.fetched_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(slot.value);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        match self.fetch(url).await {
            Some(value) => {
                *self.cache.write() = Some(CacheSlot {
                    fetched_at: Instant::now(),
                    value,
                });
                Some(value)
            }
            None => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                // Stale last-good beats nothing
                self.cache.read().as_ref().map(|slot| slot.value)
            }
        }
    }

    async fn fetch(&self, url: &str) -> Option<f64> {
        let resp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "signal source unreachable");
                return None;
            }
        };
        let body: SignalBody = match resp.error_for_status().ok()?.json().await {
            Ok(b) => b,
            Err(e) => {
                debug!(error = %e, "signal source returned malformed body");
                return None;
            }
        };
        if !body.signal.is_finite() {
            return None;
        }
        Some(body.signal.clamp(0.0, 1.0))
    }

    pub fn stats(&self) -> SignalStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        SignalStats {
            cache_hits: hits,
            cache_misses: misses,
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            cache_age_ms: self
                .cache
                .read()
                .as_ref()
                .map(|s| s.fetched_at.elapsed().as_millis() as u64),
            configured: self.url.is_some(),
        }
    }

    /// Force a refetch on the next sample.
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}
