//! First-error-wins abort signal.
//!
//! Every instance gets an [`AbortReporter`]. The first failure reported
//! fills the single slot and wakes everyone waiting on [`AbortSignal`];
//! later failures are only kept for diagnostics.

use super::error::InstanceError;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{error, warn};

struct AbortState {
    slot: watch::Sender<Option<Arc<InstanceError>>>,
    diagnostics: Mutex<Vec<Arc<InstanceError>>>,
}

/// Write side, cloned into every instance task.
#[derive(Clone)]
pub struct AbortReporter {
    state: Arc<AbortState>,
}

impl AbortReporter {
    /// Create a reporter and the signal it feeds.
    pub fn new() -> (Self, AbortSignal) {
        let (slot, rx) = watch::channel(None);
        let state = Arc::new(AbortState {
            slot,
            diagnostics: Mutex::new(Vec::new()),
        });
        let signal = AbortSignal {
            rx,
            state: state.clone(),
        };
        (Self { state }, signal)
    }

    /// Record a failure. Returns `true` if it was the first one.
    pub fn report(&self, err: InstanceError) -> bool {
        let err = Arc::new(err);
        self.state
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(err.clone());

        let first = self.state.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(err.clone());
            true
        });

        if first {
            error!(instance = %err.instance, "{}", err);
        } else {
            warn!(instance = %err.instance, "Additional startup failure: {}", err);
        }
        first
    }
}

/// Read side handed to the caller of `Supervisor::start`.
#[derive(Clone)]
pub struct AbortSignal {
    rx: watch::Receiver<Option<Arc<InstanceError>>>,
    state: Arc<AbortState>,
}

impl AbortSignal {
    /// Wait for the first failure.
    ///
    /// Stays pending for as long as no instance has failed.
    pub async fn fired(&self) -> Arc<InstanceError> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(err) = rx.borrow_and_update().clone() {
                return err;
            }
            // The sender lives in `state`, which this signal keeps alive.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// The first failure, if any has been reported.
    pub fn current(&self) -> Option<Arc<InstanceError>> {
        self.rx.borrow().clone()
    }

    /// Every failure reported so far, in order.
    pub fn diagnostics(&self) -> Vec<Arc<InstanceError>> {
        self.state
            .diagnostics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for AbortSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortSignal")
            .field("fired", &self.current().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::error::StartupError;
    use crate::auth::SignError;
    use std::time::Duration;

    fn failure(name: &str) -> InstanceError {
        InstanceError {
            instance: name.to_string(),
            mode: "sign",
            source: StartupError::Key(SignError::InvalidKey("bad".into())),
        }
    }

    #[tokio::test]
    async fn test_first_error_wins() {
        let (reporter, signal) = AbortReporter::new();
        assert!(signal.current().is_none());

        assert!(reporter.report(failure("a")));
        assert!(!reporter.clone().report(failure("b")));

        assert_eq!(signal.fired().await.instance, "a");
        let names: Vec<_> = signal
            .diagnostics()
            .iter()
            .map(|e| e.instance.clone())
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_fired_waits_for_report() {
        let (reporter, signal) = AbortReporter::new();
        let waiter = tokio::spawn({
            let signal = signal.clone();
            async move { signal.fired().await.instance.clone() }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        reporter.report(failure("late"));
        assert_eq!(waiter.await.unwrap(), "late");
    }

    #[tokio::test]
    async fn test_fired_stays_pending_without_failures() {
        let (_reporter, signal) = AbortReporter::new();
        let result = tokio::time::timeout(Duration::from_millis(50), signal.fired()).await;
        assert!(result.is_err());
    }
}
