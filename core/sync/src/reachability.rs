//! Network reachability monitoring.
//!
//! The monitor turns a platform connectivity signal into deduplicated
//! online/offline transitions. Consumers either register a callback with
//! [`NetworkReachabilityMonitor::start`] or take a typed channel with
//! [`NetworkReachabilityMonitor::subscribe`]; the queue and the coordinator
//! use the channel so that transitions reach them as messages.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docvault_common::{Error, Result};

/// Raw path state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathStatus {
    /// A usable route exists.
    Satisfied,
    /// No usable route.
    Unsatisfied,
    /// Platform cannot tell.
    Unknown,
}

/// Connectivity as seen by the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reachability {
    Online,
    Offline,
}

impl Reachability {
    /// Whether this is `Online`.
    pub fn is_online(&self) -> bool {
        matches!(self, Reachability::Online)
    }

    /// Build from a boolean flag.
    pub fn from_online(online: bool) -> Self {
        if online {
            Reachability::Online
        } else {
            Reachability::Offline
        }
    }
}

impl From<PathStatus> for Reachability {
    fn from(status: PathStatus) -> Self {
        // Unknown is treated as offline.
        Reachability::from_online(status == PathStatus::Satisfied)
    }
}

/// Platform connectivity signal.
pub trait ConnectivitySource: Send + Sync {
    /// Subscribe to path updates. The receiver's current value is the
    /// current path state.
    fn subscribe(&self) -> watch::Receiver<PathStatus>;
}

/// Connectivity source driven by hand.
///
/// Stands in for the platform signal in simulations and tests.
#[derive(Debug, Clone)]
pub struct ManualConnectivity {
    tx: Arc<watch::Sender<PathStatus>>,
}

impl ManualConnectivity {
    /// Create a source with an initial path state.
    pub fn new(initial: PathStatus) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Report a path state.
    pub fn set_status(&self, status: PathStatus) {
        self.tx.send_replace(status);
    }

    /// Report online or offline.
    pub fn set_online(&self, online: bool) {
        self.set_status(if online {
            PathStatus::Satisfied
        } else {
            PathStatus::Unsatisfied
        });
    }
}

impl ConnectivitySource for ManualConnectivity {
    fn subscribe(&self) -> watch::Receiver<PathStatus> {
        self.tx.subscribe()
    }
}

/// Observes a connectivity source and emits online/offline transitions.
pub struct NetworkReachabilityMonitor {
    source: Arc<dyn ConnectivitySource>,
    state_tx: watch::Sender<Reachability>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkReachabilityMonitor {
    /// Create a monitor over `source`. Nothing is observed until `start`.
    pub fn new(source: Arc<dyn ConnectivitySource>) -> Self {
        let (state_tx, _rx) = watch::channel(Reachability::Offline);
        Self {
            source,
            state_tx,
            task: Mutex::new(None),
        }
    }

    /// Begin observing.
    ///
    /// `callback` is invoked once with the current state and then on every
    /// transition. Repeated path updates with the same reachability are
    /// suppressed. Calling `start` again replaces the previous observation.
    ///
    /// # Errors
    /// - Called outside a tokio runtime
    pub fn start<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let runtime = Handle::try_current()
            .map_err(|e| Error::Scheduler(format!("No runtime for reachability monitor: {}", e)))?;

        let mut rx = self.source.subscribe();
        let state_tx = self.state_tx.clone();

        let handle = runtime.spawn(async move {
            let mut last: Option<Reachability> = None;
            loop {
                let reachability = Reachability::from(*rx.borrow_and_update());
                if last != Some(reachability) {
                    if last.is_some() {
                        info!("Network reachability changed: {:?}", reachability);
                    } else {
                        debug!("Initial network reachability: {:?}", reachability);
                    }
                    last = Some(reachability);
                    state_tx.send_replace(reachability);
                    callback(reachability.is_online());
                }

                if rx.changed().await.is_err() {
                    warn!("Connectivity source closed, reporting offline");
                    if last != Some(Reachability::Offline) {
                        state_tx.send_replace(Reachability::Offline);
                        callback(false);
                    }
                    break;
                }
            }
        });

        let previous = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        Ok(())
    }

    /// Stop observing. Safe to call any number of times.
    pub fn stop(&self) {
        let handle = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            handle.abort();
            debug!("Reachability monitor stopped");
        }
    }

    /// Whether the monitor is currently observing.
    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Last reported reachability.
    pub fn reachability(&self) -> Reachability {
        *self.state_tx.borrow()
    }

    /// Whether the last reported state was online.
    pub fn is_online(&self) -> bool {
        self.reachability().is_online()
    }

    /// Typed channel of transitions.
    pub fn subscribe(&self) -> watch::Receiver<Reachability> {
        self.state_tx.subscribe()
    }
}

impl Drop for NetworkReachabilityMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
