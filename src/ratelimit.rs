//! Token-bucket rate limiting per (tenant, endpoint).
//!
//! Buckets refill continuously at the configured sustained rate and are
//! checked atomically (take-or-reject under the entry's own lock).

use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateLimitConfig;
use crate::error::GatewayError;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<(String, String), Mutex<Bucket>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
        }
    }

    /// Take one token or fail with a `Retry-After` hint.
    pub fn try_acquire(
        &self,
        tenant_id: &str,
        endpoint: &str,
        config: &RateLimitConfig,
    ) -> Result<(), GatewayError> {
        if !config.enabled {
            return Ok(());
        }
        let per_second = (config.requests_per_minute / 60.0).max(f64::MIN_POSITIVE);

        let key = (tenant_id.to_string(), endpoint.to_string());
        let entry = self.buckets.entry(key).or_insert_with(|| {
            Mutex::new(Bucket {
                tokens: config.burst,
                last_refill: Instant::now(),
            })
        });

        let mut bucket = entry.lock().expect("rate limit bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * per_second).min(config.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after_secs = ((1.0 - bucket.tokens) / per_second).ceil() as u64;
            Err(GatewayError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            })
        }
    }

    pub fn buckets_count(&self) -> usize {
        self.buckets.len()
    }
}
