//! Connection tracking for graceful drain.
//!
//! Every accepted connection (and every tunnel spawned from it) holds a
//! [`ConnectionGuard`]. On stop the tracker moves to `Draining`, which tells
//! connections to finish their current request and close; if the deadline
//! passes first it moves to `Forced` and the remaining connections drop
//! whatever they are doing.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Lifecycle phase seen by connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    /// Serving normally.
    Running,
    /// Finish in-flight work, accept no new requests.
    Draining,
    /// Close immediately.
    Forced,
}

/// How a drain ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Every connection closed before the deadline.
    Drained,
    /// The deadline passed with connections still open.
    Forced {
        /// Connections still open at the deadline.
        open: usize,
    },
}

struct GuardToken {
    _done: mpsc::Sender<()>,
    active: Arc<AtomicUsize>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Held by a connection for as long as it is open.
///
/// Clones share one slot: a connection and the tunnel spawned from it count
/// as one until both are gone.
#[derive(Clone)]
pub struct ConnectionGuard {
    _token: Arc<GuardToken>,
    phase: watch::Receiver<DrainPhase>,
}

impl ConnectionGuard {
    /// Resolve once the instance starts draining (or is forced).
    pub async fn draining(&mut self) {
        let _ = self.phase.wait_for(|p| *p != DrainPhase::Running).await;
    }

    /// Resolve once the drain deadline has passed.
    pub async fn forced(&mut self) {
        let _ = self.phase.wait_for(|p| *p == DrainPhase::Forced).await;
    }

    /// Current phase.
    pub fn phase(&self) -> DrainPhase {
        *self.phase.borrow()
    }
}

/// Tracks the open connections of one listener.
pub struct ConnectionTracker {
    done_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
    phase: watch::Sender<DrainPhase>,
    active: Arc<AtomicUsize>,
}

impl ConnectionTracker {
    /// Create a tracker in the `Running` phase.
    pub fn new() -> Self {
        let (done_tx, done_rx) = mpsc::channel(1);
        let (phase, _) = watch::channel(DrainPhase::Running);
        Self {
            done_tx,
            done_rx,
            phase,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a new connection.
    pub fn track(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard {
            _token: Arc::new(GuardToken {
                _done: self.done_tx.clone(),
                active: self.active.clone(),
            }),
            phase: self.phase.subscribe(),
        }
    }

    /// Connections currently open.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Drain until every guard is dropped or `deadline` passes.
    pub async fn drain(self, deadline: Instant) -> DrainOutcome {
        let Self {
            done_tx,
            mut done_rx,
            phase,
            active,
        } = self;
        drop(done_tx);
        phase.send_replace(DrainPhase::Draining);
        debug!(open = active.load(Ordering::SeqCst), "Draining connections");

        // Nothing is ever sent; recv returns None once the last guard is gone.
        if tokio::time::timeout_at(deadline, done_rx.recv()).await.is_ok() {
            return DrainOutcome::Drained;
        }

        let open = active.load(Ordering::SeqCst);
        warn!(open, "Drain deadline passed, force-closing connections");
        phase.send_replace(DrainPhase::Forced);
        DrainOutcome::Forced { open }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_drain_without_connections() {
        let tracker = ConnectionTracker::new();
        let outcome = tracker.drain(Instant::now() + Duration::from_secs(1)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
    }

    #[tokio::test]
    async fn test_drain_waits_for_guards() {
        let tracker = ConnectionTracker::new();
        let mut guard = tracker.track();
        assert_eq!(tracker.active(), 1);

        let conn = tokio::spawn(async move {
            guard.draining().await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        let outcome = tracker.drain(Instant::now() + Duration::from_secs(5)).await;
        assert_eq!(outcome, DrainOutcome::Drained);
        conn.await.unwrap();
    }

    #[tokio::test]
    async fn test_cloned_guards_count_once() {
        let tracker = ConnectionTracker::new();
        let guard = tracker.track();
        let tunnel = guard.clone();
        assert_eq!(tracker.active(), 1);
        drop(guard);
        assert_eq!(tracker.active(), 1);
        drop(tunnel);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_drain_forces_after_deadline() {
        let tracker = ConnectionTracker::new();
        let mut guard = tracker.track();

        let outcome = tracker.drain(Instant::now() + Duration::from_millis(50)).await;
        assert_eq!(outcome, DrainOutcome::Forced { open: 1 });

        guard.forced().await;
        assert_eq!(guard.phase(), DrainPhase::Forced);
    }
}
