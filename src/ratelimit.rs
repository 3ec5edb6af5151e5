//! Process-local per-`(village_id, client_key)` minute-bucket rate limiter.
//!
//! Advisory only: a multi-process deployment needs a front-end limiter of
//! its own, since this one only sees traffic that reaches this process.
//! State lives in a `once_cell` + `Mutex`-guarded map, evicted by minute
//! bucket as time moves forward.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

/// Map size above which stale entries are evicted.
pub const EVICTION_THRESHOLD: usize = 5000;
/// Entries whose minute is older than `now_minute - STALE_MINUTES` are
/// eligible for eviction.
pub const STALE_MINUTES: i64 = 5;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    minute_epoch: i64,
    count: u32,
}

/// A bounded, mutex-guarded `(village_id, client_key) -> (minute_epoch, count)`
/// map. Construct one per node; the process-wide default lives in
/// [`global`].
#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<(String, String), Bucket>>,
}

impl RateLimiter {
    /// A fresh, empty limiter.
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request at `now_minute` for `(village_id, client_key)` and
    /// returns whether it's within `limit_per_min`. Evicts stale entries when
    /// the map exceeds [`EVICTION_THRESHOLD`].
    pub fn check(&self, village_id: &str, client_key: &str, limit_per_min: u32, now_minute: i64) -> bool {
        let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
        if buckets.len() > EVICTION_THRESHOLD {
            let cutoff = now_minute - STALE_MINUTES;
            buckets.retain(|_, bucket| bucket.minute_epoch >= cutoff);
        }
        let key = (village_id.to_string(), client_key.to_string());
        let bucket = buckets.entry(key).or_insert(Bucket {
            minute_epoch: now_minute,
            count: 0,
        });
        if bucket.minute_epoch != now_minute {
            bucket.minute_epoch = now_minute;
            bucket.count = 0;
        }
        bucket.count += 1;
        bucket.count <= limit_per_min.max(1)
    }

    /// Current number of tracked buckets (test/diagnostic helper).
    pub fn len(&self) -> usize {
        self.buckets.lock().expect("rate limiter mutex poisoned").len()
    }

    /// True iff no bucket is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The process-wide limiter instance backing the HTTP surface's
/// `/villages/*` rate limiting.
pub static GLOBAL: Lazy<RateLimiter> = Lazy::new(RateLimiter::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_denies() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("v1", "1.2.3.4", 3, 1000));
        }
        assert!(!limiter.check("v1", "1.2.3.4", 3, 1000));
    }

    #[test]
    fn new_minute_resets_the_bucket() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            limiter.check("v1", "1.2.3.4", 3, 1000);
        }
        assert!(!limiter.check("v1", "1.2.3.4", 3, 1000));
        assert!(limiter.check("v1", "1.2.3.4", 3, 1001));
    }

    #[test]
    fn distinct_villages_or_clients_have_independent_buckets() {
        let limiter = RateLimiter::new();
        for _ in 0..3 {
            assert!(limiter.check("v1", "client-a", 3, 1000));
        }
        assert!(limiter.check("v1", "client-b", 3, 1000));
        assert!(limiter.check("v2", "client-a", 3, 1000));
    }

    #[test]
    fn eviction_drops_only_stale_buckets() {
        let limiter = RateLimiter::new();
        for i in 0..(EVICTION_THRESHOLD + 1) {
            limiter.check("v1", &format!("client-{i}"), 100, 0);
        }
        assert!(limiter.len() > EVICTION_THRESHOLD);
        limiter.check("v1", "client-new", 100, 100);
        assert!(limiter.len() < EVICTION_THRESHOLD + 2);
    }
}
