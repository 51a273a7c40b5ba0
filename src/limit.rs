// Leaky-bucket rate limiting keyed by masked client networks.
// Numan Thabit 2026

use std::net::IpAddr;
use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::info;

use crate::prefix::{mask_addr, PrefixSet};

/// One bucket per masked network.
///
/// `current` is a floating request count; NaN marks a network locked
/// out for the remainder of the bucket TTL.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    last: f64,
    current: f64,
    expires: f64,
}

/// Rate-limiter parameters.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitParams {
    /// Requests allowed to accumulate before lockout.
    pub burst: f64,
    /// Drain rate in requests per second.
    pub rate: f64,
    /// Seconds a bucket (and its lockout) survives.
    pub ttl: f64,
    /// Network mask applied to client addresses.
    pub mask: u32,
    /// Upper bound on tracked networks.
    pub max_buckets: usize,
}

/// Token-bucket-shaped limiter over an LRU of masked networks.
pub struct RateLimiter {
    buckets: LruCache<IpAddr, Bucket>,
    whitelist: PrefixSet,
    params: RateLimitParams,
}

impl RateLimiter {
    /// Creates a limiter; whitelisted networks always pass.
    pub fn new(params: RateLimitParams, whitelist: PrefixSet) -> Self {
        Self {
            buckets: LruCache::new(NonZeroUsize::new(params.max_buckets.max(1)).unwrap()),
            whitelist,
            params,
        }
    }

    /// Records one request from `addr` at `now` (seconds) and returns
    /// whether it is allowed.
    pub fn check(&mut self, addr: IpAddr, now: f64) -> bool {
        if self.whitelist.contains(addr) {
            return true;
        }

        let masked = mask_addr(addr, self.params.mask);

        let mut expired = false;
        if let Some(bucket) = self.buckets.get_mut(&masked) {
            if now >= bucket.expires {
                // TTL passed; treat as evicted and start fresh below.
                expired = true;
            } else if bucket.current.is_nan() {
                // Locked until the TTL evicts the bucket.
                return false;
            } else {
                if bucket.last < now {
                    bucket.current =
                        (bucket.current - self.params.rate * (now - bucket.last)).max(0.0);
                }
                bucket.last = now;

                if bucket.current >= self.params.burst {
                    info!(
                        client = %addr,
                        network = %masked,
                        burst = self.params.burst,
                        "ratelimiting network"
                    );
                    bucket.current = f64::NAN;
                    return false;
                }
                bucket.current += 1.0;
                return true;
            }
        }
        if expired {
            self.buckets.pop(&masked);
        }

        self.buckets.push(
            masked,
            Bucket {
                last: now,
                current: 1.0,
                expires: now + self.params.ttl,
            },
        );
        true
    }

    /// Number of tracked networks.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True when no networks are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(burst: f64, rate: f64) -> RateLimitParams {
        RateLimitParams {
            burst,
            rate,
            ttl: 3600.0,
            mask: 24,
            max_buckets: 16,
        }
    }

    #[test]
    fn burst_then_lockout() {
        let mut limiter = RateLimiter::new(params(2.0, 1.0), PrefixSet::new());
        let addr: IpAddr = "203.0.113.10".parse().unwrap();

        assert!(limiter.check(addr, 100.0));
        assert!(limiter.check(addr, 100.0));
        // Third request within the same second locks the bucket.
        assert!(!limiter.check(addr, 100.0));
        // Locked stays locked, even after the rate would have drained.
        assert!(!limiter.check(addr, 101.0));
    }

    #[test]
    fn masked_neighbors_share_a_bucket() {
        let mut limiter = RateLimiter::new(params(2.0, 1.0), PrefixSet::new());
        let a: IpAddr = "203.0.113.10".parse().unwrap();
        let b: IpAddr = "203.0.113.77".parse().unwrap();

        assert!(limiter.check(a, 10.0));
        assert!(limiter.check(b, 10.0));
        assert!(!limiter.check(a, 10.0));
        assert!(!limiter.check(b, 10.0));
    }

    #[test]
    fn drain_restores_capacity() {
        let mut limiter = RateLimiter::new(params(3.0, 1.0), PrefixSet::new());
        let addr: IpAddr = "198.51.100.4".parse().unwrap();

        assert!(limiter.check(addr, 0.0));
        assert!(limiter.check(addr, 0.1));
        assert!(limiter.check(addr, 0.2));
        // 3 accumulated; after 2 seconds of drain there is room again.
        assert!(limiter.check(addr, 2.5));
    }

    #[test]
    fn lockout_expires_with_ttl() {
        let mut limiter = RateLimiter::new(
            RateLimitParams {
                ttl: 10.0,
                ..params(1.0, 0.1)
            },
            PrefixSet::new(),
        );
        let addr: IpAddr = "198.51.100.9".parse().unwrap();

        assert!(limiter.check(addr, 0.0));
        assert!(!limiter.check(addr, 0.0));
        assert!(!limiter.check(addr, 9.9));
        // TTL elapsed; fresh bucket.
        assert!(limiter.check(addr, 10.1));
    }

    #[test]
    fn whitelist_bypasses_buckets() {
        let whitelist = PrefixSet::from_entries(&["203.0.113.0/24"]).unwrap();
        let mut limiter = RateLimiter::new(params(1.0, 0.1), whitelist);
        let addr: IpAddr = "203.0.113.5".parse().unwrap();

        for i in 0..10 {
            assert!(limiter.check(addr, i as f64 * 0.01));
        }
        assert!(limiter.is_empty());
    }

    #[test]
    fn capacity_evicts_least_recent() {
        let mut limiter = RateLimiter::new(
            RateLimitParams {
                max_buckets: 2,
                ..params(1.0, 0.1)
            },
            PrefixSet::new(),
        );

        let a: IpAddr = "10.0.0.1".parse().unwrap();
        let b: IpAddr = "10.0.1.1".parse().unwrap();
        let c: IpAddr = "10.0.2.1".parse().unwrap();

        assert!(limiter.check(a, 0.0));
        assert!(!limiter.check(a, 0.0)); // locked
        assert!(limiter.check(b, 0.2));
        assert!(limiter.check(c, 0.3)); // evicts a's lockout
        assert!(limiter.check(a, 0.4));
    }
}
