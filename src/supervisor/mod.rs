//! Lifecycle supervisor for proxy instances.
//!
//! [`Supervisor::start`] spawns one task per configured instance and returns
//! immediately with a [`StopHandle`] and an [`AbortSignal`]. Instances start
//! independently: one failing does not hold up the others, and the first
//! failure fires the abort signal.
//!
//! ```ignore
//! let (handle, abort) = Supervisor::start(&config);
//! tokio::select! {
//!     err = abort.fired() => eprintln!("{}", err),
//!     _ = tokio::signal::ctrl_c() => {}
//! }
//! let report = handle.stop(config.supervisor.stop_timeout()).await;
//! ```

pub mod abort;
pub mod error;
pub mod instance;
pub mod registry;

pub use abort::{AbortReporter, AbortSignal};
pub use error::{InstanceError, StartupError};
pub use instance::InstanceState;
pub use registry::KeyRegistry;

use crate::config::Config;
use crate::proxy::drain::DrainOutcome;
use crate::proxy::listener::BoundAddr;
use instance::{InstanceContext, InstanceExit};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Extra time past the stop deadline for instances to stop their filters.
const STOP_GRACE: Duration = Duration::from_millis(500);

/// Starts proxy instances.
pub struct Supervisor;

impl Supervisor {
    /// Spawn every enabled instance.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: &Config) -> (StopHandle, AbortSignal) {
        let (stop_tx, stop_rx) = watch::channel(None);
        let (abort, signal) = AbortReporter::new();
        let registry = Arc::new(KeyRegistry::new());
        let mut tasks = JoinSet::new();
        let mut instances = Vec::with_capacity(config.proxies.len());

        for proxy in &config.proxies {
            if !proxy.enabled {
                info!(instance = %proxy.name, "Skipping disabled instance");
                continue;
            }
            let (state_tx, state_rx) = watch::channel(InstanceState::Starting);
            instances.push(InstanceSlot {
                name: proxy.name.clone(),
                mode: proxy.mode.name(),
                state: state_rx,
            });
            tasks.spawn(instance::run(InstanceContext {
                config: proxy.clone(),
                registry: registry.clone(),
                abort: abort.clone(),
                stop: stop_rx.clone(),
                state: state_tx,
            }));
        }
        if instances.is_empty() {
            warn!("No enabled proxy instances");
        }
        info!("Supervisor started {} instance(s)", instances.len());

        let handle = StopHandle {
            stop: stop_tx,
            tasks,
            instances,
        };
        (handle, signal)
    }
}

struct InstanceSlot {
    name: String,
    mode: &'static str,
    state: watch::Receiver<InstanceState>,
}

/// Snapshot of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceStatus {
    /// Instance name.
    pub name: String,
    /// `"sign"` or `"verify"`.
    pub mode: &'static str,
    /// Current state.
    pub state: InstanceState,
}

/// Result of [`StopHandle::stop`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Instances that drained cleanly.
    pub stopped: Vec<String>,
    /// Instances whose connections were force-closed, or that did not
    /// confirm stop in time and were aborted.
    pub forced: Vec<String>,
    /// Instances that never started or whose task died.
    pub failed: Vec<String>,
}

impl StopReport {
    /// Whether every instance drained cleanly.
    pub fn is_clean(&self) -> bool {
        self.forced.is_empty() && self.failed.is_empty()
    }
}

/// Controls the running instances.
///
/// Dropping the handle without calling [`StopHandle::stop`] aborts every
/// instance task.
pub struct StopHandle {
    stop: watch::Sender<Option<Instant>>,
    tasks: JoinSet<InstanceExit>,
    instances: Vec<InstanceSlot>,
}

impl StopHandle {
    /// Snapshot the state of every instance, in configuration order.
    pub fn status(&self) -> Vec<InstanceStatus> {
        self.instances
            .iter()
            .map(|slot| InstanceStatus {
                name: slot.name.clone(),
                mode: slot.mode,
                state: slot.state.borrow().clone(),
            })
            .collect()
    }

    /// Address an instance is listening on, once it is running.
    pub fn bound_addr(&self, name: &str) -> Option<BoundAddr> {
        let slot = self.instances.iter().find(|slot| slot.name == name)?;
        match &*slot.state.borrow() {
            InstanceState::Running(addr) => Some(addr.clone()),
            _ => None,
        }
    }

    /// Wait until no instance is still starting.
    pub async fn wait_started(&self) {
        for slot in &self.instances {
            let mut state = slot.state.clone();
            // A dropped sender means the task is gone; nothing left to wait for.
            let _ = state
                .wait_for(|s| !matches!(s, InstanceState::Starting))
                .await;
        }
    }

    /// Stop every instance and wait at most `timeout` for them to drain.
    ///
    /// All instances are told to stop at once. Those still running when the
    /// deadline (plus a short grace) passes are aborted and reported as forced.
    pub async fn stop(mut self, timeout: Duration) -> StopReport {
        let deadline = Instant::now() + timeout;
        info!("Stopping {} instance(s) within {:?}", self.instances.len(), timeout);
        self.stop.send_replace(Some(deadline));

        let mut pending: BTreeSet<String> =
            self.instances.iter().map(|slot| slot.name.clone()).collect();
        let mut report = StopReport::default();

        let collect = collect_exits(&mut self.tasks, &mut pending, &mut report);
        let timed_out = tokio::time::timeout_at(deadline + STOP_GRACE, collect)
            .await
            .is_err();

        if timed_out {
            warn!(
                "{} instance(s) did not stop in time, aborting: {:?}",
                pending.len(),
                pending
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
            report.forced.extend(pending);
        } else {
            report.failed.extend(pending);
        }

        for list in [&mut report.stopped, &mut report.forced, &mut report.failed] {
            list.sort();
        }
        report
    }
}

async fn collect_exits(
    tasks: &mut JoinSet<InstanceExit>,
    pending: &mut BTreeSet<String>,
    report: &mut StopReport,
) {
    while let Some(joined) = tasks.join_next().await {
        let exit = match joined {
            Ok(exit) => exit,
            Err(e) => {
                warn!("Instance task ended abnormally: {}", e);
                continue;
            }
        };
        pending.remove(&exit.name);
        debug!(instance = %exit.name, outcome = ?exit.drain, "Instance confirmed stop");
        match exit.drain {
            Some(DrainOutcome::Drained) => report.stopped.push(exit.name),
            Some(DrainOutcome::Forced { .. }) => report.forced.push(exit.name),
            None => report.failed.push(exit.name),
        }
    }
}

impl std::fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StopHandle")
            .field("instances", &self.status())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigLoader;

    fn config(text: &str) -> Config {
        ConfigLoader::new("test.toml").parse(text).unwrap()
    }

    #[tokio::test]
    async fn test_start_and_stop_clean() {
        let config = config(
            r#"
            [[proxy]]
            name = "inbound"
            mode = "verify"
            listen = "127.0.0.1:0"
            upstream = "http://127.0.0.1:9"
            credential_source = { type = "static", keys = [{ id = "k1", secret = "s" }] }
            "#,
        );
        let (handle, abort) = Supervisor::start(&config);
        handle.wait_started().await;

        assert!(handle.bound_addr("inbound").and_then(|a| a.tcp()).is_some());
        assert!(abort.current().is_none());

        let report = handle.stop(Duration::from_secs(2)).await;
        assert_eq!(report.stopped, vec!["inbound".to_string()]);
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn test_failed_instance_reported() {
        let config = config(
            r#"
            [[proxy]]
            name = "broken"
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k1", secret_file = "/nonexistent/hmac-proxy/key" }
            "#,
        );
        let (handle, abort) = Supervisor::start(&config);
        handle.wait_started().await;

        let err = abort.fired().await;
        assert_eq!(err.instance, "broken");
        assert!(matches!(err.source, StartupError::Key(_)));
        assert!(matches!(
            handle.status()[0].state,
            InstanceState::Failed(_)
        ));

        let report = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(report.failed, vec!["broken".to_string()]);
    }

    #[tokio::test]
    async fn test_disabled_instance_is_not_started() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let taken = listener.local_addr().unwrap();
        let config = config(&format!(
            r#"
            [[proxy]]
            name = "inbound"
            mode = "verify"
            listen = "127.0.0.1:0"
            upstream = "http://127.0.0.1:9"
            credential_source = {{ type = "static", keys = [{{ id = "k1", secret = "s" }}] }}

            [[proxy]]
            name = "parked"
            mode = "verify"
            enabled = false
            listen = "{taken}"
            upstream = "http://127.0.0.1:9"
            credential_source = {{ type = "static", keys = [{{ id = "k1", secret = "s" }}] }}
            "#
        ));
        let (handle, abort) = Supervisor::start(&config);
        handle.wait_started().await;

        // The disabled entry would fail to bind its address if it ran.
        assert!(abort.current().is_none());
        let names: Vec<_> = handle.status().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["inbound".to_string()]);
        assert!(handle.bound_addr("parked").is_none());

        let report = handle.stop(Duration::from_secs(2)).await;
        assert_eq!(report.stopped, vec!["inbound".to_string()]);
        drop(listener);
    }

    #[tokio::test]
    async fn test_bad_listen_address_fails_only_that_instance() {
        let config = config(
            r#"
            [[proxy]]
            name = "inbound"
            mode = "verify"
            listen = "127.0.0.1:0"
            upstream = "http://127.0.0.1:9"
            credential_source = { type = "static", keys = [{ id = "k1", secret = "s" }] }

            [[proxy]]
            name = "misplaced"
            mode = "sign"
            listen = "not-an-address"
            key = { id = "k2", secret = "s" }
            "#,
        );
        let (handle, abort) = Supervisor::start(&config);
        handle.wait_started().await;

        let err = abort.fired().await;
        assert_eq!(err.instance, "misplaced");
        assert!(matches!(err.source, StartupError::Config(_)));
        assert!(err.to_string().contains("listen"), "{}", err);
        assert!(handle.bound_addr("inbound").is_some());

        let report = handle.stop(Duration::from_secs(1)).await;
        assert_eq!(report.stopped, vec!["inbound".to_string()]);
        assert_eq!(report.failed, vec!["misplaced".to_string()]);
    }

    #[tokio::test]
    async fn test_key_conflict_fails_second_signer() {
        let config = config(
            r#"
            [[proxy]]
            name = "a"
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k1", secret = "one" }
            interception = { insecure_skip_verify = true }

            [[proxy]]
            name = "b"
            mode = "sign"
            listen = "127.0.0.1:0"
            key = { id = "k1", secret = "two" }
            interception = { insecure_skip_verify = true }
            "#,
        );
        let (handle, abort) = Supervisor::start(&config);
        handle.wait_started().await;

        let diagnostics = abort.diagnostics();
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(diagnostics[0].source, StartupError::KeyConflict(_)));

        let running = handle
            .status()
            .iter()
            .filter(|s| matches!(s.state, InstanceState::Running(_)))
            .count();
        assert_eq!(running, 1);
        handle.stop(Duration::from_secs(1)).await;
    }
}
