//! Limiter trait for abstracting over the deployment modes.

use async_trait::async_trait;

use super::bucket::TokenBucket;
use super::cancel::Cancellation;
use super::keyed::KeyedLimiter;
use super::shared::SharedStoreLimiter;
use crate::error::Result;
use crate::store::AtomicStore;

/// Trait for admission control front ends.
///
/// This trait abstracts over the single `TokenBucket`, the per-key
/// `KeyedLimiter` and the `SharedStoreLimiter` so a server can work with
/// any of them.
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Decide whether `requested` tokens may be taken for `key` right now.
    async fn allow(&self, key: &str, requested: u32) -> bool;

    /// Wait until `requested` tokens are taken for `key`, or `cancel` fires.
    async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()>;
}

/// A single bucket shared by every key.
#[async_trait]
impl Limiter for TokenBucket {
    async fn allow(&self, _key: &str, requested: u32) -> bool {
        TokenBucket::allow(self, requested)
    }

    async fn wait(&self, _key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        TokenBucket::wait(self, requested, cancel).await
    }
}

#[async_trait]
impl Limiter for KeyedLimiter {
    async fn allow(&self, key: &str, requested: u32) -> bool {
        KeyedLimiter::allow(self, key, requested)
    }

    async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        KeyedLimiter::wait(self, key, requested, cancel).await
    }
}

#[async_trait]
impl<S: AtomicStore> Limiter for SharedStoreLimiter<S> {
    async fn allow(&self, key: &str, requested: u32) -> bool {
        SharedStoreLimiter::allow(self, key, requested).await
    }

    async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        SharedStoreLimiter::wait(self, key, requested, cancel).await
    }
}

#[async_trait]
impl<L: Limiter + ?Sized> Limiter for std::sync::Arc<L> {
    async fn allow(&self, key: &str, requested: u32) -> bool {
        (**self).allow(key, requested).await
    }

    async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        (**self).wait(key, requested, cancel).await
    }
}
