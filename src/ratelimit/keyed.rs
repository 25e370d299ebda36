//! Per-key token buckets.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, trace};

use super::bucket::TokenBucket;
use super::cancel::Cancellation;
use crate::clock::SharedClock;
use crate::error::Result;

/// A registry of independent token buckets, one per key.
///
/// All buckets share one capacity, refill rate and clock. Buckets are created
/// on first use and never removed, so memory grows with the number of
/// distinct keys seen.
pub struct KeyedLimiter {
    /// Buckets indexed by key
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    capacity: f64,
    refill_rate: f64,
    clock: SharedClock,
}

impl KeyedLimiter {
    /// Create an empty limiter.
    pub fn new(capacity: f64, refill_rate: f64, clock: SharedClock) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            capacity,
            refill_rate: refill_rate.max(0.0),
            clock,
        }
    }

    /// Take `requested` tokens from `key`'s bucket if available.
    pub fn allow(&self, key: &str, requested: u32) -> bool {
        let bucket = self.bucket(key);
        let allowed = bucket.allow(requested);

        if !allowed {
            debug!(key = %key, requested, "Rate limit exceeded");
        }
        allowed
    }

    /// Wait for `requested` tokens from `key`'s bucket.
    pub async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        let bucket = self.bucket(key);
        bucket.wait(requested, cancel).await
    }

    /// Tokens currently available for `key`, if its bucket exists.
    pub fn available(&self, key: &str) -> Option<f64> {
        let bucket = self.buckets.read().get(key).cloned();
        bucket.map(|b| b.available())
    }

    /// Get the number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Resolve the bucket for `key`, creating it on first reference.
    ///
    /// The map lock is released before the caller touches the bucket.
    fn bucket(&self, key: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(key) {
            trace!(key = %key, "Bucket found");
            return bucket.clone();
        }

        let mut buckets = self.buckets.write();

        // Another caller may have created it between the two locks
        if let Some(bucket) = buckets.get(key) {
            return bucket.clone();
        }

        debug!(
            key = %key,
            capacity = self.capacity,
            refill_rate = self.refill_rate,
            "Creating new token bucket"
        );
        let bucket = Arc::new(TokenBucket::new(
            self.capacity,
            self.refill_rate,
            self.clock.clone(),
        ));
        buckets.insert(key.to_string(), bucket.clone());
        bucket
    }
}

impl std::fmt::Debug for KeyedLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyedLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("buckets", &self.bucket_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TollgateError;
    use std::time::Duration;

    fn keyed(capacity: f64, refill_rate: f64) -> (KeyedLimiter, ManualClock) {
        let clock = ManualClock::new();
        let limiter = KeyedLimiter::new(capacity, refill_rate, Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[test]
    fn test_keyed_limiter_creation() {
        let (limiter, _clock) = keyed(5.0, 1.0);
        assert_eq!(limiter.bucket_count(), 0);
        assert_eq!(limiter.available("nobody"), None);
    }

    #[test]
    fn test_negative_refill_rate_never_drains_buckets() {
        let (limiter, clock) = keyed(4.0, -1.0);
        assert!(limiter.allow("k", 4));

        clock.advance(Duration::from_secs(30));
        assert_eq!(limiter.available("k"), Some(0.0));
        assert!(!limiter.allow("k", 1));
    }

    #[test]
    fn test_allow_creates_bucket_lazily() {
        let (limiter, _clock) = keyed(5.0, 1.0);

        assert!(limiter.allow("user1", 1));
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(limiter.available("user1"), Some(4.0));
    }

    #[test]
    fn test_keys_do_not_interact() {
        let (limiter, _clock) = keyed(5.0, 1.0);

        assert!(limiter.allow("a", 5));
        assert!(!limiter.allow("a", 1));

        assert!(limiter.allow("b", 5));
        assert_eq!(limiter.available("a"), Some(0.0));
        assert_eq!(limiter.bucket_count(), 2);
    }

    #[test]
    fn test_same_key_reuses_bucket() {
        let (limiter, clock) = keyed(3.0, 1.0);

        for _ in 0..3 {
            assert!(limiter.allow("user", 1));
        }
        assert!(!limiter.allow("user", 1));
        assert_eq!(limiter.bucket_count(), 1);

        clock.advance(Duration::from_secs(1));
        assert!(limiter.allow("user", 1));
    }

    #[test]
    fn test_exceeds_capacity_per_key() {
        let (limiter, _clock) = keyed(3.0, 1.0);
        assert!(!limiter.allow("user", 4));
        assert_eq!(limiter.available("user"), Some(3.0));
    }

    #[test]
    fn test_concurrent_resolution_creates_one_bucket_per_key() {
        let (limiter, _clock) = keyed(1000.0, 0.0);
        let limiter = Arc::new(limiter);

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        assert!(limiter.allow(&format!("key-{}", i % 10), 1));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(limiter.bucket_count(), 10);
        for i in 0..10 {
            // 8 threads x 10 hits per key, all against a single bucket
            assert_eq!(limiter.available(&format!("key-{}", i)), Some(920.0));
        }
    }

    #[tokio::test]
    async fn test_wait_delegates_to_bucket() {
        let (limiter, _clock) = keyed(5.0, 1.0);

        limiter.wait("user", 5, &Cancellation::none()).await.unwrap();
        assert_eq!(limiter.available("user"), Some(0.0));

        let err = limiter
            .wait("user", 6, &Cancellation::none())
            .await
            .unwrap_err();
        assert!(matches!(err, TollgateError::ExceedsCapacity { .. }));
    }

    #[tokio::test]
    async fn test_wait_on_exhausted_key_leaves_others_alone() {
        let (limiter, _clock) = keyed(2.0, 1.0);
        assert!(limiter.allow("slow", 2));

        let cancel = Cancellation::none();
        cancel.cancel();
        let err = limiter.wait("slow", 1, &cancel).await.unwrap_err();
        assert!(matches!(err, TollgateError::Cancelled));

        assert!(limiter.allow("fast", 2));
        assert_eq!(limiter.available("slow"), Some(0.0));
    }
}
