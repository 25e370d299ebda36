//! Token bucket implementation.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::cancel::Cancellation;
use crate::clock::SharedClock;
use crate::error::{Result, TollgateError};

/// Mutable state of a bucket, guarded by a single lock.
#[derive(Debug)]
struct BucketState {
    /// Tokens currently available, always within `0..=capacity`
    tokens: f64,
    /// Last instant the token count was recalculated
    last_refill: Instant,
}

/// A single token bucket with continuous refill.
///
/// Refill and consumption happen together under one lock, so concurrent
/// callers observe a serialized sequence of refill+consume operations.
pub struct TokenBucket {
    /// Maximum tokens the bucket can hold
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    state: Mutex<BucketState>,
    clock: SharedClock,
}

/// Outcome of one locked refill-and-consume attempt.
enum Attempt {
    Granted,
    /// Time until enough tokens accrue; `None` when they never will
    RetryAfter(Option<Duration>),
}

impl TokenBucket {
    /// Create a new bucket that starts full.
    ///
    /// A negative or NaN refill rate is treated as zero.
    pub fn new(capacity: f64, refill_rate: f64, clock: SharedClock) -> Self {
        let refill_rate = refill_rate.max(0.0);
        let now = clock.now();
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: now,
            }),
            clock,
        }
    }

    /// Take `requested` tokens if they are available right now.
    ///
    /// A request larger than the capacity is always denied.
    pub fn allow(&self, requested: u32) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let requested = f64::from(requested);
        if requested > self.capacity {
            return false;
        }

        if state.tokens >= requested {
            state.tokens -= requested;
            trace!(requested, remaining = state.tokens, "Tokens granted");
            true
        } else {
            false
        }
    }

    /// Block until `requested` tokens are taken or `cancel` fires.
    ///
    /// The lock is released before sleeping, and no tokens are taken on the
    /// cancellation path.
    pub async fn wait(&self, requested: u32, cancel: &Cancellation) -> Result<()> {
        if f64::from(requested) > self.capacity {
            return Err(TollgateError::ExceedsCapacity {
                requested,
                capacity: self.capacity,
            });
        }

        loop {
            let delay = match self.try_acquire(requested) {
                Attempt::Granted => return Ok(()),
                Attempt::RetryAfter(delay) => delay,
            };

            trace!(requested, ?delay, "Waiting for tokens");

            match delay {
                Some(delay) => tokio::select! {
                    err = cancel.fired() => return Err(err),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => return Err(cancel.fired().await),
            }
        }
    }

    /// Current token count after applying any pending refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn try_acquire(&self, requested: u32) -> Attempt {
        let mut state = self.state.lock();
        self.refill(&mut state);

        let requested = f64::from(requested);
        if state.tokens >= requested {
            state.tokens -= requested;
            return Attempt::Granted;
        }

        let deficit = requested - state.tokens;
        Attempt::RetryAfter(self.time_to_accrue(deficit))
    }

    fn time_to_accrue(&self, deficit: f64) -> Option<Duration> {
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate).ok()
    }

    /// Add tokens for the time elapsed since the last refill.
    ///
    /// The timestamp only moves forward, so a clock reading earlier than the
    /// last refill adds nothing and loses nothing.
    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);

        if elapsed > Duration::ZERO {
            let added = elapsed.as_secs_f64() * self.refill_rate;
            state.tokens = (state.tokens + added).min(self.capacity);
            state.last_refill = now;
        }
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}
