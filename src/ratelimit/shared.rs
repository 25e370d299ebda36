//! Shared-store rate limiter.
//!
//! Token state lives in an [`AtomicStore`] shared by every instance. When the
//! store cannot be used, either because a call failed or because the circuit
//! breaker is open, the configured [`FailureMode`] decides the outcome and the
//! error itself only reaches the observer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::breaker::CircuitBreaker;
use super::cancel::Cancellation;
use super::keyed::KeyedLimiter;
use super::observer::{NoopObserver, Observer};
use crate::clock::{SharedClock, SystemClock};
use crate::error::{Result, TollgateError};
use crate::store::{AtomicStore, StoreError};

/// Default interval between admission attempts in [`SharedStoreLimiter::wait`].
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// What to decide when the shared store is unavailable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request
    #[default]
    Open,
    /// Reject the request
    Closed,
    /// Decide with a local per-instance limiter of the same shape
    Degrade,
}

impl fmt::Display for FailureMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureMode::Open => "open",
            FailureMode::Closed => "closed",
            FailureMode::Degrade => "degrade",
        };
        f.write_str(name)
    }
}

impl FromStr for FailureMode {
    type Err = TollgateError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "open" => Ok(FailureMode::Open),
            "closed" => Ok(FailureMode::Closed),
            "degrade" => Ok(FailureMode::Degrade),
            other => Err(TollgateError::Config(format!(
                "unknown failure mode {other:?}, expected open, closed or degrade"
            ))),
        }
    }
}

/// A rate limiter whose buckets live in a shared store.
pub struct SharedStoreLimiter<S> {
    store: S,
    capacity: f64,
    refill_rate: f64,
    key_prefix: String,
    failure_mode: FailureMode,
    breaker: Option<CircuitBreaker>,
    /// Present only in [`FailureMode::Degrade`]
    fallback: Option<KeyedLimiter>,
    observer: Arc<dyn Observer>,
    poll_interval: Duration,
}

impl<S: AtomicStore> SharedStoreLimiter<S> {
    /// Start building a limiter over `store`.
    pub fn builder(
        store: S,
        capacity: f64,
        refill_rate: f64,
        key_prefix: impl Into<String>,
    ) -> SharedStoreLimiterBuilder<S> {
        SharedStoreLimiterBuilder {
            store,
            capacity,
            refill_rate,
            key_prefix: key_prefix.into(),
            failure_mode: FailureMode::default(),
            breaker: None,
            observer: Arc::new(NoopObserver),
            clock: Arc::new(SystemClock),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Decide whether `requested` tokens may be taken for `key`.
    ///
    /// Makes at most one store round trip. Store failures never surface here;
    /// they become a failure-mode decision.
    pub async fn allow(&self, key: &str, requested: u32) -> bool {
        if let Some(breaker) = &self.breaker {
            if !breaker.allow() {
                trace!(key = %key, "Circuit open, skipping store");
                self.observer.on_error(key, &StoreError::CircuitOpen);
                return self.handle_failure(key, requested);
            }
        }

        let store_key = format!("{}{}", self.key_prefix, key);
        let start = Instant::now();
        let result = self
            .store
            .check_and_decrement(&store_key, requested, self.capacity, self.refill_rate)
            .await;
        self.observer.on_latency(key, start.elapsed());

        match result {
            Ok(decision) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_success();
                }
                if decision.allowed {
                    self.observer.on_allow(key);
                } else {
                    debug!(key = %key, remaining = decision.remaining, "Rate limit exceeded");
                    self.observer.on_deny(key);
                }
                decision.allowed
            }
            Err(err) => {
                if let Some(breaker) = &self.breaker {
                    breaker.record_failure();
                }
                self.observer.on_error(key, &err);
                self.handle_failure(key, requested)
            }
        }
    }

    /// Poll [`allow`](Self::allow) until it admits the request or `cancel`
    /// fires.
    pub async fn wait(&self, key: &str, requested: u32, cancel: &Cancellation) -> Result<()> {
        if f64::from(requested) > self.capacity {
            return Err(TollgateError::ExceedsCapacity {
                requested,
                capacity: self.capacity,
            });
        }

        loop {
            if self.allow(key, requested).await {
                return Ok(());
            }

            tokio::select! {
                err = cancel.fired() => return Err(err),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Get the circuit breaker, if one is configured.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    /// Get the local fallback limiter used in degrade mode.
    pub fn fallback(&self) -> Option<&KeyedLimiter> {
        self.fallback.as_ref()
    }

    fn handle_failure(&self, key: &str, requested: u32) -> bool {
        let allowed = match (&self.failure_mode, &self.fallback) {
            (FailureMode::Open, _) => true,
            (FailureMode::Closed, _) => false,
            (FailureMode::Degrade, Some(local)) => local.allow(key, requested),
            // The builder always creates the fallback for degrade mode
            (FailureMode::Degrade, None) => true,
        };

        debug!(key = %key, mode = %self.failure_mode, allowed, "Store unavailable, applied failure mode");
        if allowed {
            self.observer.on_allow(key);
        } else {
            self.observer.on_deny(key);
        }
        allowed
    }
}

impl<S> fmt::Debug for SharedStoreLimiter<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedStoreLimiter")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("key_prefix", &self.key_prefix)
            .field("failure_mode", &self.failure_mode)
            .field("breaker", &self.breaker)
            .finish()
    }
}

/// Builder for [`SharedStoreLimiter`].
pub struct SharedStoreLimiterBuilder<S> {
    store: S,
    capacity: f64,
    refill_rate: f64,
    key_prefix: String,
    failure_mode: FailureMode,
    breaker: Option<(u32, Duration)>,
    observer: Arc<dyn Observer>,
    clock: SharedClock,
    poll_interval: Duration,
}

impl<S: AtomicStore> SharedStoreLimiterBuilder<S> {
    /// Set the behaviour when the store is unavailable (default: open).
    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Guard the store with a circuit breaker.
    pub fn circuit_breaker(mut self, threshold: u32, timeout: Duration) -> Self {
        self.breaker = Some((threshold, timeout));
        self
    }

    /// Set the observer notified of every decision (default: no-op).
    pub fn observer(mut self, observer: Arc<dyn Observer>) -> Self {
        self.observer = observer;
        self
    }

    /// Set the clock used by the breaker and the degrade-mode fallback.
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the interval between attempts in `wait` (default: 20ms).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn build(self) -> SharedStoreLimiter<S> {
        let breaker = self
            .breaker
            .map(|(threshold, timeout)| CircuitBreaker::new(threshold, timeout, self.clock.clone()));

        let fallback = (self.failure_mode == FailureMode::Degrade)
            .then(|| KeyedLimiter::new(self.capacity, self.refill_rate, self.clock.clone()));

        SharedStoreLimiter {
            store: self.store,
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            key_prefix: self.key_prefix,
            failure_mode: self.failure_mode,
            breaker,
            fallback,
            observer: self.observer,
            poll_interval: self.poll_interval,
        }
    }
}
