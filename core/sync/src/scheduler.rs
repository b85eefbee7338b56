//! Sync scheduling - manual and periodic modes.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info};

use docvault_common::{Error, Result};

use crate::coordinator::SyncCoordinator;
use crate::state::SyncReport;

/// Sync mode configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMode {
    /// Sync only when requested.
    #[default]
    Manual,
    /// Check staleness at regular intervals and sync when needed.
    Periodic { interval: Duration },
}

impl SyncMode {
    fn interval(&self) -> Option<Duration> {
        match self {
            SyncMode::Manual => None,
            SyncMode::Periodic { interval } => Some(*interval),
        }
    }
}

enum SchedulerRequest {
    Sync(oneshot::Sender<Result<SyncReport>>),
    ModeChanged,
    Shutdown,
}

/// Front end for requesting syncs and changing the mode.
#[derive(Clone)]
pub struct SyncScheduler {
    mode: Arc<RwLock<SyncMode>>,
    request_tx: mpsc::Sender<SchedulerRequest>,
}

impl SyncScheduler {
    /// Create a new scheduler with the given mode.
    ///
    /// The returned handle must be run for requests to be served.
    pub fn new(mode: SyncMode) -> (Self, SyncSchedulerHandle) {
        let (request_tx, request_rx) = mpsc::channel(32);
        let mode = Arc::new(RwLock::new(mode));

        let scheduler = Self {
            mode: mode.clone(),
            request_tx,
        };
        let handle = SyncSchedulerHandle { mode, request_rx };

        (scheduler, handle)
    }

    /// Request a sync pass and wait for its report.
    pub async fn request_sync(&self) -> Result<SyncReport> {
        let (response_tx, response_rx) = oneshot::channel();

        self.request_tx
            .send(SchedulerRequest::Sync(response_tx))
            .await
            .map_err(|_| Error::Scheduler("Scheduler not running".to_string()))?;

        response_rx
            .await
            .map_err(|_| Error::Scheduler("Failed to receive sync result".to_string()))?
    }

    /// Change the sync mode.
    pub async fn set_mode(&self, mode: SyncMode) {
        *self.mode.write().await = mode;
        let _ = self.request_tx.send(SchedulerRequest::ModeChanged).await;
    }

    /// Get current sync mode.
    pub async fn mode(&self) -> SyncMode {
        self.mode.read().await.clone()
    }

    /// Stop the background task.
    pub async fn shutdown(&self) {
        let _ = self.request_tx.send(SchedulerRequest::Shutdown).await;
    }
}

/// Background side of the scheduler.
pub struct SyncSchedulerHandle {
    mode: Arc<RwLock<SyncMode>>,
    request_rx: mpsc::Receiver<SchedulerRequest>,
}

impl SyncSchedulerHandle {
    /// Serve requests until shutdown or until every scheduler is dropped.
    ///
    /// Periodic ticks only start a pass when the coordinator reports that it
    /// needs one.
    pub async fn run(mut self, coordinator: Arc<SyncCoordinator>) {
        let mut ticker = self.create_ticker().await;

        info!("Sync scheduler started");

        loop {
            tokio::select! {
                request = self.request_rx.recv() => {
                    match request {
                        Some(SchedulerRequest::Sync(response_tx)) => {
                            debug!("Processing sync request");
                            let _ = response_tx.send(coordinator.perform_sync().await);
                        }
                        Some(SchedulerRequest::ModeChanged) => {
                            debug!("Sync mode changed");
                            ticker = self.create_ticker().await;
                        }
                        Some(SchedulerRequest::Shutdown) | None => {
                            info!("Sync scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = Self::wait_for_tick(&mut ticker) => {
                    if !coordinator.needs_sync().await {
                        debug!("Periodic check: sync not needed");
                        continue;
                    }
                    match coordinator.perform_sync().await {
                        Ok(report) => info!(
                            "Periodic sync finished: {} ({} committed, {} conflicts)",
                            report.status, report.entities_committed, report.conflicts_found
                        ),
                        Err(e) => error!("Periodic sync failed: {}", e),
                    }
                }
            }
        }
    }

    async fn create_ticker(&self) -> Option<Interval> {
        let period = self.mode.read().await.interval()?;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(ticker)
    }

    async fn wait_for_tick(ticker: &mut Option<Interval>) {
        match ticker {
            Some(ticker) => {
                ticker.tick().await;
            }
            None => std::future::pending::<()>().await,
        }
    }
}
