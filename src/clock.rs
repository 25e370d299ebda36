//! Time sources for the limiters.
//!
//! Every stateful component reads time through [`Clock`] so tests can drive
//! refill and breaker timeouts deterministically.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Supplies the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Shared handle to a clock, cloned into every bucket and breaker.
pub type SharedClock = Arc<dyn Clock>;

/// Reads the process monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Reads tokio's clock, so paused and auto-advanced runtime time applies.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// A virtual clock that only moves when [`ManualClock::advance`] is called.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<Instant>>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            current: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Move the clock forward.
    ///
    /// An advance past the largest representable instant leaves the clock
    /// where it is.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        if let Some(later) = current.checked_add(by) {
            *current = later;
        }
    }

    /// Move the clock backward, for exercising non-monotonic sources.
    pub fn rewind(&self, by: Duration) {
        let mut current = self.current.lock();
        if let Some(earlier) = current.checked_sub(by) {
            *current = earlier;
        }
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        *self.current.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_only_moves_when_advanced() {
        let clock = ManualClock::new();
        let start = clock.now();

        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now() - start, Duration::from_secs(2));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new();
        let other = clock.clone();

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn test_manual_clock_ignores_overflowing_advance() {
        let clock = ManualClock::new();
        let start = clock.now();

        clock.advance(Duration::MAX);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_manual_clock_rewind() {
        let clock = ManualClock::new();
        clock.advance(Duration::from_secs(5));
        let later = clock.now();

        clock.rewind(Duration::from_secs(1));
        assert_eq!(later - clock.now(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock;
        let start = clock.now();

        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(clock.now() - start >= Duration::from_secs(3));
    }
}
