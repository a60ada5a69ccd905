//! Throttling of bundle fetches.
//!
//! Keys are opaque strings naming a (caller device, target) pair. The
//! reference limiter keeps one token bucket per key in memory with a fixed
//! bound on tracked keys, evicting the least recently used.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::KeysError;

/// Upper bound on buckets held at once.
pub const MAX_TRACKED_KEYS: usize = 100_000;

#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Consume one permit for `key`, or fail with `KeysError::RateLimited`.
    async fn validate(&self, key: &str) -> Result<(), KeysError>;
}

/// Bucket capacity and refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimiterConfig {
    pub bucket_size: u32,
    pub leak_rate_per_minute: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            bucket_size: 6000,
            leak_rate_per_minute: 100.0,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    fn full(config: &RateLimiterConfig, now: Instant) -> Self {
        Self {
            tokens: f64::from(config.bucket_size),
            last_update: now,
        }
    }

    /// Refill for the time elapsed since the last call, then try to take one
    /// token. On refusal returns how long until a token is available.
    fn try_consume(&mut self, config: &RateLimiterConfig, now: Instant) -> Result<(), Duration> {
        let rate_per_sec = config.leak_rate_per_minute / 60.0;
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(f64::from(config.bucket_size));
        self.last_update = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        if rate_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        Err(Duration::try_from_secs_f64((1.0 - self.tokens) / rate_per_sec).unwrap_or(Duration::MAX))
    }
}

#[derive(Debug)]
struct Entry {
    bucket: TokenBucket,
    last_access: Instant,
}

/// In-memory token-bucket limiter.
#[derive(Debug)]
pub struct TokenBucketLimiter {
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<String, Entry>>,
}

impl TokenBucketLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), KeysError> {
        let mut buckets = self.buckets.lock();

        if !buckets.contains_key(key) && buckets.len() >= MAX_TRACKED_KEYS {
            let oldest = buckets
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(key, _)| key.clone());
            if let Some(oldest) = oldest {
                buckets.remove(&oldest);
            }
        }

        let entry = buckets.entry(key.to_owned()).or_insert_with(|| Entry {
            bucket: TokenBucket::full(&self.config, now),
            last_access: now,
        });
        entry.last_access = now;

        entry
            .bucket
            .try_consume(&self.config, now)
            .map_err(|retry_after| {
                tracing::debug!(key, retry_after_ms = retry_after.as_millis(), "rate limited");
                KeysError::RateLimited { retry_after }
            })
    }
}

impl Default for TokenBucketLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}

#[async_trait]
impl RateLimiter for TokenBucketLimiter {
    async fn validate(&self, key: &str) -> Result<(), KeysError> {
        self.check_at(key, Instant::now())
    }
}

/// Limiter that never refuses.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

#[async_trait]
impl RateLimiter for Unlimited {
    async fn validate(&self, _key: &str) -> Result<(), KeysError> {
        Ok(())
    }
}
