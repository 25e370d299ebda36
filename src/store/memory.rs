//! In-process shared store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::trace;

use super::{AtomicStore, StoreDecision, StoreError};
use crate::clock::SharedClock;

/// Persisted bucket state for one key.
#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    tokens: f64,
    timestamp: Instant,
}

/// A store living in this process, shared by every limiter holding it.
///
/// Each key's update runs under its dashmap shard lock, which gives the same
/// per-key atomicity a scripted remote store provides. The store can be taken
/// offline to rehearse outages.
pub struct MemoryStore {
    buckets: DashMap<String, StoredBucket>,
    clock: SharedClock,
    offline: AtomicBool,
}

impl MemoryStore {
    /// Create an empty store that reads time from `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            offline: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`], or
    /// bring the store back.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Stored token count for `key`, as last persisted.
    pub fn stored_tokens(&self, key: &str) -> Option<f64> {
        self.buckets.get(key).map(|entry| entry.tokens)
    }

    /// Get the number of keys held.
    pub fn key_count(&self) -> usize {
        self.buckets.len()
    }
}

#[async_trait]
impl AtomicStore for MemoryStore {
    async fn check_and_decrement(
        &self,
        key: &str,
        requested: u32,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<StoreDecision, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }

        let now = self.clock.now();
        let mut entry = self.buckets.entry(key.to_string()).or_insert(StoredBucket {
            tokens: capacity,
            timestamp: now,
        });

        let elapsed = now.saturating_duration_since(entry.timestamp);
        let mut tokens = refilled(entry.tokens, elapsed, capacity, refill_rate);

        let requested = f64::from(requested);
        let allowed = tokens >= requested;
        if allowed {
            tokens -= requested;
        }

        let timestamp = now.max(entry.timestamp);
        *entry = StoredBucket { tokens, timestamp };

        trace!(key = %key, allowed, remaining = tokens, "Store check-and-decrement");
        Ok(StoreDecision {
            allowed,
            remaining: tokens,
        })
    }
}

fn refilled(tokens: f64, elapsed: Duration, capacity: f64, refill_rate: f64) -> f64 {
    (tokens + elapsed.as_secs_f64() * refill_rate).min(capacity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::new();
        (MemoryStore::new(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_absent_key_starts_full() {
        let (store, _clock) = store();

        let decision = store.check_and_decrement("k", 2, 5.0, 1.0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 3.0);
        assert_eq!(store.key_count(), 1);
    }

    #[tokio::test]
    async fn test_denial_persists_refreshed_state() {
        let (store, clock) = store();

        store.check_and_decrement("k", 5, 5.0, 1.0).await.unwrap();
        clock.advance(Duration::from_secs(2));

        let decision = store.check_and_decrement("k", 3, 5.0, 1.0).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 2.0);
        assert_eq!(store.stored_tokens("k"), Some(2.0));

        // The refill was persisted, so no time is counted twice
        let decision = store.check_and_decrement("k", 2, 5.0, 1.0).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 0.0);
    }

    #[tokio::test]
    async fn test_refill_capped_at_capacity() {
        let (store, clock) = store();

        store.check_and_decrement("k", 4, 5.0, 1.0).await.unwrap();
        clock.advance(Duration::from_secs(60));

        let decision = store.check_and_decrement("k", 0, 5.0, 1.0).await.unwrap();
        assert_eq!(decision.remaining, 5.0);
    }

    #[tokio::test]
    async fn test_concurrent_callers_never_overdraw() {
        let (store, _clock) = store();
        let store = Arc::new(store);

        let calls = (0..50).map(|_| {
            let store = store.clone();
            async move { store.check_and_decrement("shared", 1, 10.0, 0.0).await }
        });
        let results = futures::future::join_all(calls).await;

        let allowed = results
            .into_iter()
            .filter(|r| r.as_ref().map(|d| d.allowed).unwrap_or(false))
            .count();
        assert_eq!(allowed, 10);
    }

    #[tokio::test]
    async fn test_offline_store_errors() {
        let (store, _clock) = store();
        store.set_offline(true);

        let err = store.check_and_decrement("k", 1, 5.0, 1.0).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.key_count(), 0);

        store.set_offline(false);
        assert!(store.check_and_decrement("k", 1, 5.0, 1.0).await.is_ok());
    }
}
