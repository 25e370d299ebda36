//! Caller-supplied cancellation for blocking waits.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::TollgateError;

/// Cancellation token plus an optional deadline.
///
/// A wait observes both: explicit cancellation resolves to
/// [`TollgateError::Cancelled`], an expired deadline to
/// [`TollgateError::DeadlineExceeded`].
#[derive(Debug, Clone, Default)]
pub struct Cancellation {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Cancellation {
    /// A signal that never fires on its own.
    pub fn none() -> Self {
        Self::default()
    }

    /// Fire when `token` is cancelled.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Fire once `timeout` has elapsed from now.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(at) => Self::none().deadline(at),
            None => Self::none(),
        }
    }

    /// Set (or tighten) the deadline.
    pub fn deadline(mut self, at: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(at),
            None => at,
        });
        self
    }

    /// Cancel every wait observing this signal.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Resolve once the signal fires, yielding the matching error.
    pub async fn fired(&self) -> TollgateError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => TollgateError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => TollgateError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                TollgateError::Cancelled
            }
        }
    }
}

impl From<CancellationToken> for Cancellation {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_deadline_exceeded() {
        let cancel = Cancellation::with_timeout(Duration::from_millis(50));

        let start = Instant::now();
        let err = cancel.fired().await;
        assert!(matches!(err, TollgateError::DeadlineExceeded));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_token_fires_cancelled() {
        let token = CancellationToken::new();
        let cancel = Cancellation::from(token.clone());

        let mut fired = task::spawn(cancel.fired());
        assert_pending!(fired.poll());

        token.cancel();
        assert!(fired.is_woken());
        assert!(matches!(assert_ready!(fired.poll()), TollgateError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancel_reaches_clones() {
        let cancel = Cancellation::none();
        let clone = cancel.clone();

        cancel.cancel();
        assert!(matches!(clone.fired().await, TollgateError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_only_tightens() {
        let now = Instant::now();
        let cancel = Cancellation::none()
            .deadline(now + Duration::from_secs(1))
            .deadline(now + Duration::from_secs(10));

        let err = tokio::time::timeout(Duration::from_secs(2), cancel.fired())
            .await
            .expect("the earlier deadline should win");
        assert!(matches!(err, TollgateError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_timeout_means_no_deadline() {
        let cancel = Cancellation::with_timeout(Duration::MAX);

        let mut fired = task::spawn(cancel.fired());
        assert_pending!(fired.poll());

        tokio::time::advance(Duration::from_secs(365 * 24 * 3600)).await;
        assert_pending!(fired.poll());

        cancel.cancel();
        assert!(matches!(assert_ready!(fired.poll()), TollgateError::Cancelled));
    }
}
