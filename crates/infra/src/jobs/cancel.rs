//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::Notify;

const OPEN: u8 = 0;
const CANCELLED: u8 = 1;
const SEALED: u8 = 2;

/// Shared cancellation flag for one running job.
///
/// Workers check it between item dispatches; setting it never interrupts an
/// in-flight AI call. Backoff sleeps can wait on [`CancellationFlag::cancelled`]
/// to wake early.
///
/// The executor [`seal`](CancellationFlag::seal)s the flag before choosing a
/// terminal status. Cancellation and sealing are exclusive: whichever comes
/// first wins, so an accepted cancel always ends the job CANCELLED.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    state: AtomicU8,
    notify: Notify,
}

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    ///
    /// Returns `false` when the flag was already sealed and the request had
    /// no effect.
    pub fn cancel(&self) -> bool {
        match self
            .inner
            .state
            .compare_exchange(OPEN, CANCELLED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {
                self.inner.notify.notify_waiters();
                true
            }
            Err(current) => current == CANCELLED,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// Refuse further cancellation. Returns `true` if cancellation was
    /// requested first.
    pub fn seal(&self) -> bool {
        match self
            .inner
            .state
            .compare_exchange(OPEN, SEALED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => false,
            Err(current) => current == CANCELLED,
        }
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn clones_share_state() {
        let flag = CancellationFlag::new();
        let other = flag.clone();
        assert!(!other.is_cancelled());
        flag.cancel();
        assert!(other.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_for_waiters() {
        let flag = CancellationFlag::new();
        let waiter = {
            let flag = flag.clone();
            tokio::spawn(async move { flag.cancelled().await })
        };
        tokio::task::yield_now().await;
        flag.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();

        // Already cancelled: returns immediately.
        flag.cancelled().await;
    }

    #[test]
    fn cancel_and_seal_are_exclusive() {
        let flag = CancellationFlag::new();
        assert!(!flag.seal());
        assert!(!flag.cancel());
        assert!(!flag.is_cancelled());

        let flag = CancellationFlag::new();
        assert!(flag.cancel());
        assert!(flag.cancel());
        assert!(flag.seal());
        assert!(flag.is_cancelled());
    }
}
