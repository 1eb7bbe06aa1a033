use crate::config::RateLimitConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;
use tracing::debug;

#[derive(Clone, Debug)]
pub struct Limits {
    /// Tokens added per minute.
    pub tokens_per_minute: f64,
    /// Bucket capacity; also the number of tokens a new principal starts with.
    pub burst: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            tokens_per_minute: 30.0,
            burst: 1,
        }
    }
}

impl From<&RateLimitConfig> for Limits {
    fn from(cfg: &RateLimitConfig) -> Self {
        Self {
            tokens_per_minute: cfg.tokens_per_minute,
            burst: cfg.burst,
        }
    }
}

/// Continuously refilled token bucket. Tokens and last refill time are
/// updated together under one lock.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<(f64, Instant)>,
}

impl TokenBucket {
    pub fn new(limits: &Limits, now: Instant) -> Self {
        let capacity = limits.burst as f64;
        Self {
            capacity,
            refill_per_sec: limits.tokens_per_minute / 60.0,
            state: Mutex::new((capacity, now)),
        }
    }

    /// Take one token if available at `now`. Never waits.
    pub fn try_acquire_at(&self, now: Instant) -> bool {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (ref mut tokens, ref mut last) = *guard;
        // A caller holding an older instant must not rewind the bucket
        let elapsed = now.saturating_duration_since(*last).as_secs_f64();
        *tokens = (*tokens + elapsed * self.refill_per_sec).min(self.capacity);
        if now > *last {
            *last = now;
        }
        if *tokens >= 1.0 {
            *tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently held, without refilling.
    pub fn tokens(&self) -> f64 {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).0
    }
}

/// Per-principal admission control. One bucket per principal, created lazily
/// on first use and kept for the life of the limiter.
#[derive(Debug)]
pub struct RateLimiter {
    limits: Limits,
    buckets: RwLock<HashMap<u64, Arc<TokenBucket>>>,
}

impl RateLimiter {
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    pub fn allow(&self, principal_id: u64) -> bool {
        self.allow_at(principal_id, Instant::now())
    }

    pub fn allow_at(&self, principal_id: u64, now: Instant) -> bool {
        let bucket = self.bucket(principal_id, now);
        let allowed = bucket.try_acquire_at(now);
        debug!(
            principal_id,
            tokens = bucket.tokens(),
            allowed,
            "rate limiter decision"
        );
        allowed
    }

    /// Shared bucket for a principal. Concurrent first access for the same
    /// principal observes a single instance.
    pub fn bucket(&self, principal_id: u64, now: Instant) -> Arc<TokenBucket> {
        {
            let buckets = self.buckets.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(bucket) = buckets.get(&principal_id) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().unwrap_or_else(PoisonError::into_inner);
        // Re-check under the write lock: another caller may have inserted first
        let bucket = buckets
            .entry(principal_id)
            .or_insert_with(|| Arc::new(TokenBucket::new(&self.limits, now)));
        let bucket = Arc::clone(bucket);
        let tracked = buckets.len();
        drop(buckets);
        crate::metrics::AdmissionMetrics::record_tracked_principals(tracked);
        bucket
    }

    /// Number of principals holding a bucket. Grows without bound: buckets are never evicted.
    pub fn tracked_principals(&self) -> usize {
        self.buckets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter() -> RateLimiter {
        RateLimiter::new(Limits {
            tokens_per_minute: 30.0,
            burst: 1,
        })
    }

    #[test]
    fn burst_then_deny() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.allow_at(1, t0));
        assert!(!rl.allow_at(1, t0));
        assert!(!rl.allow_at(1, t0 + Duration::from_millis(1_999)));
    }

    #[test]
    fn refills_at_configured_rate() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.allow_at(1, t0));
        // 30/min is one token every two seconds
        assert!(rl.allow_at(1, t0 + Duration::from_secs(2)));
        assert!(!rl.allow_at(1, t0 + Duration::from_secs(3)));
        assert!(rl.allow_at(1, t0 + Duration::from_secs(4)));
    }

    #[test]
    fn refill_is_capped_at_burst() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.allow_at(1, t0));
        let later = t0 + Duration::from_secs(600);
        assert!(rl.allow_at(1, later));
        assert!(!rl.allow_at(1, later));
    }

    #[test]
    fn principals_are_independent() {
        let rl = limiter();
        let t0 = Instant::now();
        assert!(rl.allow_at(1, t0));
        assert!(!rl.allow_at(1, t0));
        assert!(rl.allow_at(2, t0));
        assert_eq!(rl.tracked_principals(), 2);
    }

    #[test]
    fn larger_burst_allows_prefix() {
        let rl = RateLimiter::new(Limits {
            tokens_per_minute: 60.0,
            burst: 3,
        });
        let t0 = Instant::now();
        let allowed = (0..10).filter(|_| rl.allow_at(5, t0)).count();
        assert_eq!(allowed, 3);
    }

    #[test]
    fn stale_instant_does_not_rewind() {
        let rl = limiter();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(2);
        assert!(rl.allow_at(1, t1));
        // An earlier timestamp from a slow caller gets no refill credit
        assert!(!rl.allow_at(1, t0));
        assert!(!rl.allow_at(1, t1 + Duration::from_secs(1)));
    }
}
