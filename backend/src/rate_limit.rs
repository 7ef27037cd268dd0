//! Per-identity token-bucket rate limiter for the HTTP ingest edge (§4.E).

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    buckets: DashMap<String, Mutex<Bucket>>,
    capacity: f64,
    refill_per_sec: f64,
}

impl RateLimiter {
    pub fn new(limit_per_min: u32) -> Self {
        let capacity = limit_per_min.max(1) as f64;
        Self {
            buckets: DashMap::new(),
            capacity,
            refill_per_sec: capacity / 60.0,
        }
    }

    /// `true` if `identity` has a token to spend right now.
    pub fn check(&self, identity: &str) -> bool {
        let entry = self
            .buckets
            .entry(identity.to_string())
            .or_insert_with(|| Mutex::new(Bucket { tokens: self.capacity, last_refill: Instant::now() }));
        let mut bucket = entry.lock().expect("rate limiter bucket poisoned");

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(2);
        assert!(limiter.check("client-a"));
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = RateLimiter::new(1);
        assert!(limiter.check("client-a"));
        assert!(!limiter.check("client-a"));
        assert!(limiter.check("client-b"));
    }
}
