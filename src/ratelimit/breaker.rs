//! Circuit breaker guarding the shared store.
//!
//! ```text
//! Closed   --threshold failures-->  Open
//! Open     --timeout elapsed----->  HalfOpen   (on the next allow())
//! HalfOpen --success------------->  Closed
//! HalfOpen --failure------------->  Open
//! ```
//!
//! Every call is let through while half-open, so concurrent callers may all
//! probe the store at once.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::clock::SharedClock;

/// State of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through to the guarded resource
    Closed,
    /// The resource is presumed down; calls fail fast
    Open,
    /// Probing for recovery; calls pass through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    /// Consecutive failures since the last success
    failures: u32,
    last_failure: Option<Instant>,
}

/// Three-state failure detector.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    /// Failures at which the breaker opens
    threshold: u32,
    /// How long the breaker stays open before probing
    timeout: Duration,
    clock: SharedClock,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(threshold: u32, timeout: Duration, clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
            }),
            threshold,
            timeout,
            clock,
        }
    }

    /// Ask whether a call to the guarded resource may proceed.
    ///
    /// An open breaker whose timeout has elapsed moves to half-open and lets
    /// the call through.
    pub fn allow(&self) -> bool {
        let mut inner = self.state.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let now = self.clock.now();
                let elapsed = inner
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);

                if elapsed >= self.timeout {
                    info!(elapsed = ?elapsed, "Circuit breaker half-open, probing store");
                    inner.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call: reset the failure count and close.
    pub fn record_success(&self) {
        let mut inner = self.state.lock();

        if inner.state != CircuitState::Closed {
            info!(from = %inner.state, "Circuit breaker closed");
        }
        inner.failures = 0;
        inner.state = CircuitState::Closed;
    }

    /// Record a failed call, opening the breaker once the threshold is hit.
    pub fn record_failure(&self) {
        let mut inner = self.state.lock();

        inner.failures = inner.failures.saturating_add(1);
        inner.last_failure = Some(self.clock.now());

        if inner.failures >= self.threshold {
            if inner.state != CircuitState::Open {
                warn!(
                    failures = inner.failures,
                    threshold = self.threshold,
                    timeout = ?self.timeout,
                    "Circuit breaker opened"
                );
            }
            inner.state = CircuitState::Open;
        }
    }

    /// Get the current state.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Get the consecutive failure count.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().failures
    }

    /// Get the failure threshold.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Get the open timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("state", &inner.state)
            .field("failures", &inner.failures)
            .field("threshold", &self.threshold)
            .field("timeout", &self.timeout)
            .finish()
    }
}
