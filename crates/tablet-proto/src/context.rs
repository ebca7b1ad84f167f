//! Per-call cancellation and deadline.

use std::time::Duration;

use tablet_common::error::TabletError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation signal and optional deadline attached to one call.
///
/// Cloning a context shares its token, so cancelling any clone cancels
/// them all. [`CallContext::child`] derives a context that is cancelled
/// with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl CallContext {
    /// A context that is never cancelled on its own.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// A context that expires after `timeout`.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Returns a copy whose deadline is at most `timeout` from now.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        self.deadline = Some(self.deadline.map_or(deadline, |d| d.min(deadline)));
        self
    }

    /// Derives a child context sharing this deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancels this context and its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the underlying cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true if the context was cancelled or its deadline passed.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns the `Cancelled` error describing why the context ended, or
    /// `None` while it is still live.
    #[must_use]
    pub fn err(&self) -> Option<TabletError> {
        if self.token.is_cancelled() {
            Some(TabletError::cancelled("context cancelled"))
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(TabletError::cancelled("context deadline exceeded"))
        } else {
            None
        }
    }

    /// Completes when the context is cancelled or its deadline passes.
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Completes with the error describing why the context ended.
    pub async fn done(&self) -> TabletError {
        self.cancelled().await;
        self.err()
            .unwrap_or_else(|| TabletError::cancelled("context cancelled"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_common::error::ErrorKind;

    #[test]
    fn test_background_is_live() {
        let ctx = CallContext::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.err().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_child() {
        let parent = CallContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        assert_eq!(child.err().map(|e| e.kind()), Some(ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn test_deadline_expires() {
        let ctx = CallContext::with_timeout(Duration::from_millis(10));
        let err = ctx.done().await;
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.message(), "context deadline exceeded");
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_timeout_keeps_earliest_deadline() {
        let ctx = CallContext::with_timeout(Duration::from_millis(5));
        let first = ctx.deadline();
        let ctx = ctx.timeout(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), first);
    }
}
