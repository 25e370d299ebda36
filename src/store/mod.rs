//! Shared token stores.
//!
//! A store performs the whole refill-compare-decrement step atomically on its
//! side using its own clock, so every limiter instance sharing it computes
//! against one authoritative time source.

mod memory;
#[cfg(feature = "redis")]
mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisStore;

/// Errors that can occur while talking to a shared store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The circuit breaker rejected the call before it reached the store
    #[error("circuit breaker is open")]
    CircuitOpen,
    /// The store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// The store answered with something unexpected
    #[error("unexpected store reply: {0}")]
    Protocol(String),
    /// Redis client errors
    #[cfg(feature = "redis")]
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// Result of a store-side check-and-decrement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreDecision {
    /// Whether the requested tokens were taken
    pub allowed: bool,
    /// Tokens left in the bucket after the operation
    pub remaining: f64,
}

/// A store that can atomically refill and decrement a bucket.
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Refill `key`'s bucket from the store clock, then take `requested`
    /// tokens if enough are present.
    ///
    /// An absent bucket starts full. The refreshed token count and timestamp
    /// are persisted whether or not the request is granted.
    async fn check_and_decrement(
        &self,
        key: &str,
        requested: u32,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<StoreDecision, StoreError>;
}

#[async_trait]
impl<S: AtomicStore + ?Sized> AtomicStore for std::sync::Arc<S> {
    async fn check_and_decrement(
        &self,
        key: &str,
        requested: u32,
        capacity: f64,
        refill_rate: f64,
    ) -> Result<StoreDecision, StoreError> {
        (**self)
            .check_and_decrement(key, requested, capacity, refill_rate)
            .await
    }
}
