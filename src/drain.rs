//! In-flight connection tracking for graceful shutdown.
//!
//! Every accepted connection holds a [`DrainGuard`] for as long as it is being
//! served. Dropping the guard is the only way to leave the tracker, so a
//! decrement without a matching increment cannot be written.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Returned by [`DrainTracker::wait_timeout`] when connections are still open.
#[derive(Debug, thiserror::Error)]
#[error("{remaining} connection(s) still in flight after {waited:?}")]
pub struct DrainTimeout {
    pub remaining: usize,
    pub waited: Duration,
}

/// Counts in-flight connections and lets callers wait for the count to reach zero.
#[derive(Debug, Clone)]
pub struct DrainTracker {
    count: Arc<watch::Sender<usize>>,
}

impl Default for DrainTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainTracker {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }

    /// Register one in-flight connection. It leaves when the guard drops.
    pub fn enter(&self) -> DrainGuard {
        self.count.send_modify(|count| *count += 1);
        DrainGuard {
            count: self.count.clone(),
        }
    }

    /// Number of connections currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.count.borrow()
    }

    /// Wait until no connection is in flight.
    pub async fn wait(&self) {
        let mut rx = self.count.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|count| *count == 0).await;
    }

    /// Like [`wait`](Self::wait), but gives up after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Result<(), DrainTimeout> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| DrainTimeout {
                remaining: self.in_flight(),
                waited: limit,
            })
    }
}

/// Proof of one tracked connection; leaves the tracker on drop.
#[derive(Debug)]
#[must_use = "the connection leaves the tracker as soon as the guard is dropped"]
pub struct DrainGuard {
    count: Arc<watch::Sender<usize>>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.count.send_modify(|count| *count -= 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_idle() {
        let tracker = DrainTracker::new();
        tracker.wait_timeout(Duration::from_millis(50)).await.unwrap();
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_enter_and_drop_guard() {
        let tracker = DrainTracker::new();
        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.in_flight(), 2);

        drop(a);
        assert_eq!(tracker.in_flight(), 1);
        drop(b);
        assert_eq!(tracker.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_remaining() {
        let tracker = DrainTracker::new();
        let _guard = tracker.enter();

        let err = tracker
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err.remaining, 1);
    }

    #[tokio::test]
    async fn test_wait_blocks_until_last_guard_drops() {
        let tracker = DrainTracker::new();
        let guards: Vec<_> = (0..50).map(|_| tracker.enter()).collect();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        for guard in guards {
            tokio::spawn(async move { drop(guard) });
        }

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("drain did not complete")
            .unwrap();
        assert_eq!(tracker.in_flight(), 0);
    }
}
