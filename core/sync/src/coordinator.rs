//! Sync coordinator that drives the phased reconciliation pass.

use chrono::{DateTime, Utc};
use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use docvault_common::{EntityId, Error, Result};
use docvault_store::Persistence;

use crate::clock::{Clock, SystemClock};
use crate::conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, ResolutionResult};
use crate::reachability::Reachability;
use crate::state::{SyncPhase, SyncReport, SyncSnapshot, SyncStatus, COMPLETE_PROGRESS};

/// Configuration for the sync coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Age after which the last sync counts as stale.
    pub staleness_threshold: Duration,
    /// Strategy used by `resolve_all`.
    pub default_strategy: ConflictStrategy,
    /// Initial connectivity assumption before any reachability update.
    pub assume_online: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            staleness_threshold: Duration::from_secs(300),
            default_strategy: ConflictStrategy::Manual,
            assume_online: false,
        }
    }
}

#[derive(Debug)]
struct CoordinatorState {
    status: SyncStatus,
    progress: f64,
    last_sync_time: Option<DateTime<Utc>>,
    conflicts: Vec<ConflictInfo>,
    online: bool,
    in_flight: bool,
    /// Bumped each time a pass starts.
    pass: u64,
}

impl CoordinatorState {
    fn snapshot(&self) -> SyncSnapshot {
        SyncSnapshot {
            status: self.status,
            progress: self.progress,
            last_sync_time: self.last_sync_time,
            conflict_count: self.conflicts.len(),
            is_online: self.online,
        }
    }
}

/// Resets a pass whose future was dropped before its final transition.
struct PassGuard<'a> {
    coordinator: &'a SyncCoordinator,
    pass: u64,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.coordinator.lock_state();
        if !state.in_flight || state.pass != self.pass {
            return;
        }
        warn!("Sync pass cancelled");
        state.in_flight = false;
        state.progress = 0.0;
        state.status = if state.online {
            SyncStatus::Idle
        } else {
            SyncStatus::Offline
        };
        self.coordinator.publish(&state);
    }
}

/// Run a persistence call, turning a panic into a storage error.
async fn isolate<T, F>(phase: SyncPhase, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    AssertUnwindSafe(call)
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(Error::Storage(format!("Persistence panicked during {}", phase))))
}

/// Coordinates sync passes against a persistence collaborator.
///
/// Every pass runs the entity-group phases in a fixed order, each committed
/// on its own, followed by a conflict check. A failing phase stops the pass
/// without undoing earlier phases.
pub struct SyncCoordinator {
    /// Persistence collaborator, injected after construction.
    persistence: RwLock<Option<Arc<dyn Persistence>>>,
    /// Coordinator state. Never held across an await.
    state: Mutex<CoordinatorState>,
    /// Conflict resolver.
    resolver: ConflictResolver,
    /// Time source for staleness.
    clock: Arc<dyn Clock>,
    /// Published snapshots.
    snapshot_tx: watch::Sender<SyncSnapshot>,
    /// Configuration.
    config: CoordinatorConfig,
}

impl SyncCoordinator {
    /// Create a coordinator without persistence.
    pub fn new(config: CoordinatorConfig) -> Self {
        let state = CoordinatorState {
            status: SyncStatus::Idle,
            progress: 0.0,
            last_sync_time: None,
            conflicts: Vec::new(),
            online: config.assume_online,
            in_flight: false,
            pass: 0,
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());

        Self {
            persistence: RwLock::new(None),
            state: Mutex::new(state),
            resolver: ConflictResolver::new(config.default_strategy),
            clock: Arc::new(SystemClock),
            snapshot_tx,
            config,
        }
    }

    /// Use a specific clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the persistence collaborator at construction.
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = RwLock::new(Some(persistence));
        self
    }

    /// Set the persistence collaborator and refresh the status.
    pub async fn configure(&self, persistence: Arc<dyn Persistence>) {
        info!("Sync coordinator configured with {} store", persistence.name());
        *self.persistence.write().await = Some(persistence);
        self.refresh_status().await;
    }

    /// Get the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Run one full sync pass.
    ///
    /// # Postconditions
    /// - Offline: status `Offline`, no phase work, `Ok`
    /// - Success: status `Synced` or `Conflict`, progress back to 0.0
    /// - Phase failure or panic in the store: status `Error`, progress 0.0,
    ///   error returned
    /// - Future dropped mid-pass: status `Idle` (`Offline` when disconnected),
    ///   progress 0.0, committed phases stay committed
    ///
    /// # Errors
    /// - `PersistenceUnavailable` when no store is configured
    /// - `SyncPhase` when a phase fails
    pub async fn perform_sync(&self) -> Result<SyncReport> {
        let start = Instant::now();
        let persistence = self.persistence.read().await.clone();

        let (pass, persistence) = {
            let mut state = self.lock_state();
            if !state.online {
                state.status = SyncStatus::Offline;
                self.publish(&state);
                info!("Sync skipped: offline");
                return Ok(SyncReport::skipped(SyncStatus::Offline, false));
            }
            let Some(persistence) = persistence else {
                return Err(Error::PersistenceUnavailable);
            };
            if state.in_flight {
                debug!("Sync already in progress");
                return Ok(SyncReport::skipped(state.status, true));
            }
            state.in_flight = true;
            state.pass += 1;
            state.status = SyncStatus::Syncing;
            state.progress = 0.0;
            self.publish(&state);
            (state.pass, persistence)
        };
        let _guard = PassGuard {
            coordinator: self,
            pass,
        };

        info!("Starting sync pass");
        let mut phases_completed = Vec::with_capacity(SyncPhase::ORDER.len());
        let mut entities_committed = 0;

        for phase in SyncPhase::ORDER {
            self.set_progress(phase.progress());
            let Some(group) = phase.group() else {
                continue;
            };

            debug!("Sync phase {}: saving {}", phase, group);
            match isolate(phase, persistence.save(group)).await {
                Ok(committed) => {
                    entities_committed += committed;
                    phases_completed.push(phase);
                }
                Err(e) => return Err(self.fail_pass(phase, e)),
            }
        }

        let checked = isolate(SyncPhase::ConflictCheck, persistence.fetch_revisions()).await;
        let conflicts = match checked {
            Ok(records) => self.resolver.detect(&records),
            Err(e) => return Err(self.fail_pass(SyncPhase::ConflictCheck, e)),
        };
        phases_completed.push(SyncPhase::ConflictCheck);
        self.set_progress(COMPLETE_PROGRESS);

        let conflicts_found = conflicts.len();
        let status = {
            let mut state = self.lock_state();
            state.in_flight = false;
            state.progress = 0.0;
            state.conflicts = conflicts;
            if conflicts_found == 0 {
                state.status = SyncStatus::Synced;
                state.last_sync_time = Some(self.clock.now());
            } else {
                state.status = SyncStatus::Conflict;
            }
            self.publish(&state);
            state.status
        };

        let duration = start.elapsed();
        info!(
            "Sync pass completed in {:?}: {} committed, {} conflicts",
            duration, entities_committed, conflicts_found
        );

        Ok(SyncReport {
            status,
            phases_completed,
            entities_committed,
            conflicts_found,
            duration,
            already_running: false,
        })
    }

    /// Apply `strategy` to a conflicted entity and re-run conflict detection.
    ///
    /// # Errors
    /// - `PersistenceUnavailable` when no store is configured
    /// - `NotFound` when the store has no record for the entity
    /// - `InvalidInput` when the entity is not in conflict
    pub async fn resolve_conflict(
        &self,
        entity_id: &EntityId,
        strategy: ConflictStrategy,
    ) -> Result<ResolutionResult> {
        let persistence = self.persistence().await?;

        let record = persistence
            .fetch_revision(entity_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("No sync record for {}", entity_id)))?;

        let Some(conflict) = self.resolver.detect(std::slice::from_ref(&record)).pop() else {
            return Err(Error::InvalidInput(format!(
                "Entity {} is not in conflict",
                entity_id
            )));
        };

        let result = self
            .resolver
            .resolve(&conflict, persistence.as_ref(), strategy)
            .await?;
        info!("Resolved conflict on {} with {:?}: {:?}", entity_id, strategy, result);

        self.check_conflicts(persistence.as_ref()).await?;
        Ok(result)
    }

    /// Resolve every known conflict with the default strategy.
    ///
    /// Returns how many were committed; `Manual` commits none.
    pub async fn resolve_all(&self) -> Result<usize> {
        let strategy = self.config.default_strategy;
        let pending: Vec<EntityId> = self
            .lock_state()
            .conflicts
            .iter()
            .map(|c| c.entity_id.clone())
            .collect();

        let mut resolved = 0;
        for entity_id in pending {
            match self.resolve_conflict(&entity_id, strategy).await? {
                ResolutionResult::Pending => {}
                _ => resolved += 1,
            }
        }
        Ok(resolved)
    }

    /// Whether the last successful sync is missing or stale.
    pub async fn needs_sync(&self) -> bool {
        let last = self.lock_state().last_sync_time;
        self.is_stale(last)
    }

    /// Recompute the resting status from connectivity and staleness.
    pub async fn refresh_status(&self) {
        let mut state = self.lock_state();
        if state.in_flight {
            return;
        }
        let needs_sync = self.is_stale(state.last_sync_time);
        state.status = if !state.online {
            SyncStatus::Offline
        } else if needs_sync {
            SyncStatus::Idle
        } else {
            SyncStatus::Synced
        };
        self.publish(&state);
    }

    /// Apply a connectivity change.
    ///
    /// Going offline sets `Offline` immediately, even mid-pass; the pass's own
    /// final status still replaces it when it ends. Reconnecting returns an
    /// `Offline` coordinator to `Idle` without starting a pass.
    pub async fn set_online(&self, online: bool) {
        let mut state = self.lock_state();
        state.online = online;
        if !online {
            state.status = SyncStatus::Offline;
            info!("Sync offline");
        } else if state.status == SyncStatus::Offline {
            state.status = SyncStatus::Idle;
            info!("Sync back online");
        }
        self.publish(&state);
    }

    /// Forward reachability transitions to this coordinator.
    ///
    /// Must be called from within a tokio runtime.
    pub fn follow(self: &Arc<Self>, mut reachability: watch::Receiver<Reachability>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let online = reachability.borrow_and_update().is_online();
                coordinator.set_online(online).await;
                if reachability.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Current status.
    pub async fn status(&self) -> SyncStatus {
        self.lock_state().status
    }

    /// Current progress fraction.
    pub async fn progress(&self) -> f64 {
        self.lock_state().progress
    }

    /// Number of conflicts found by the last check.
    pub async fn conflict_count(&self) -> usize {
        self.lock_state().conflicts.len()
    }

    /// Time of the last clean pass.
    pub async fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        self.lock_state().last_sync_time
    }

    /// Conflicts found by the last check.
    pub async fn conflicts(&self) -> Vec<ConflictInfo> {
        self.lock_state().conflicts.clone()
    }

    /// Full state snapshot.
    pub async fn snapshot(&self) -> SyncSnapshot {
        self.lock_state().snapshot()
    }

    /// Snapshot updates, pushed after every change.
    pub fn watch(&self) -> watch::Receiver<SyncSnapshot> {
        self.snapshot_tx.subscribe()
    }

    async fn persistence(&self) -> Result<Arc<dyn Persistence>> {
        self.persistence
            .read()
            .await
            .clone()
            .ok_or(Error::PersistenceUnavailable)
    }

    fn lock_state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, last: Option<DateTime<Utc>>) -> bool {
        match last {
            None => true,
            Some(last) => match (self.clock.now() - last).to_std() {
                Ok(elapsed) => elapsed > self.config.staleness_threshold,
                Err(_) => false,
            },
        }
    }

    fn set_progress(&self, progress: f64) {
        let mut state = self.lock_state();
        state.progress = state.progress.max(progress);
        self.publish(&state);
    }

    fn fail_pass(&self, phase: SyncPhase, source: Error) -> Error {
        warn!("Sync phase {} failed: {}", phase, source);
        let mut state = self.lock_state();
        state.in_flight = false;
        state.status = SyncStatus::Error;
        state.progress = 0.0;
        self.publish(&state);
        Error::SyncPhase {
            phase: phase.as_str().to_string(),
            source: Box::new(source),
        }
    }

    async fn check_conflicts<P: Persistence + ?Sized>(&self, persistence: &P) -> Result<()> {
        let records = persistence.fetch_revisions().await?;
        let conflicts = self.resolver.detect(&records);

        let mut state = self.lock_state();
        let remaining = conflicts.len();
        state.conflicts = conflicts;
        if !state.in_flight && matches!(state.status, SyncStatus::Conflict | SyncStatus::Synced) {
            if remaining == 0 {
                if state.status == SyncStatus::Conflict {
                    state.last_sync_time = Some(self.clock.now());
                }
                state.status = SyncStatus::Synced;
            } else {
                state.status = SyncStatus::Conflict;
            }
        }
        self.publish(&state);
        debug!("Conflict check: {} remaining", remaining);
        Ok(())
    }

    fn publish(&self, state: &CoordinatorState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use async_trait::async_trait;
    use docvault_store::{EntityGroup, MemoryStore, Resolution, RevisionRecord};
    use tokio::sync::{mpsc, Semaphore};

    /// Store that reports each phase call and parks it until released.
    struct GatedStore {
        inner: MemoryStore,
        calls: mpsc::UnboundedSender<&'static str>,
        gate: Arc<Semaphore>,
        panic_on: Option<EntityGroup>,
    }

    impl GatedStore {
        fn new(inner: MemoryStore) -> (Self, mpsc::UnboundedReceiver<&'static str>, Arc<Semaphore>) {
            let (calls, rx) = mpsc::unbounded_channel();
            let gate = Arc::new(Semaphore::new(0));
            let store = Self {
                inner,
                calls,
                gate: gate.clone(),
                panic_on: None,
            };
            (store, rx, gate)
        }

        async fn enter(&self, call: &'static str) {
            let _ = self.calls.send(call);
            self.gate.acquire().await.unwrap().forget();
        }
    }

    #[async_trait]
    impl Persistence for GatedStore {
        fn name(&self) -> &str {
            "gated"
        }

        async fn save(&self, group: EntityGroup) -> Result<usize> {
            if self.panic_on == Some(group) {
                panic!("store crashed while saving {group}");
            }
            self.enter(group.as_str()).await;
            self.inner.save(group).await
        }

        async fn fetch_revisions(&self) -> Result<Vec<RevisionRecord>> {
            self.enter("revisions").await;
            self.inner.fetch_revisions().await
        }

        async fn fetch_revision(&self, entity_id: &EntityId) -> Result<Option<RevisionRecord>> {
            self.inner.fetch_revision(entity_id).await
        }

        async fn commit_resolution(&self, entity_id: &EntityId, resolution: Resolution) -> Result<()> {
            self.inner.commit_resolution(entity_id, resolution).await
        }
    }

    fn spawn_pass(coordinator: &Arc<SyncCoordinator>) -> JoinHandle<Result<SyncReport>> {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.perform_sync().await })
    }

    fn online_config() -> CoordinatorConfig {
        CoordinatorConfig {
            assume_online: true,
            ..CoordinatorConfig::default()
        }
    }

    fn id(s: &str) -> EntityId {
        EntityId::new(s).unwrap()
    }

    async fn store_with_conflict(entity: &str) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .put_record(RevisionRecord::in_sync(id(entity), EntityGroup::Documents, "r1"))
            .await;
        store.modify_local(&id(entity), EntityGroup::Documents).await;
        store.modify_remote(&id(entity), EntityGroup::Documents).await;
        store
    }

    #[tokio::test]
    async fn test_offline_sync_does_no_work() {
        let store = MemoryStore::new();
        let coordinator = SyncCoordinator::new(CoordinatorConfig::default())
            .with_persistence(Arc::new(store.clone()));

        let report = coordinator.perform_sync().await.unwrap();

        assert_eq!(report.status, SyncStatus::Offline);
        assert!(report.phases_completed.is_empty());
        assert_eq!(coordinator.status().await, SyncStatus::Offline);
        assert_eq!(coordinator.progress().await, 0.0);
        assert!(store.save_log().await.is_empty());
    }

    #[tokio::test]
    async fn test_successful_sync_runs_phases_in_order() {
        let store = MemoryStore::new();
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store.clone()));
        let started = Utc::now();

        let report = coordinator.perform_sync().await.unwrap();

        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(report.phases_completed, SyncPhase::ORDER.to_vec());
        assert_eq!(
            store.save_log().await,
            vec![
                EntityGroup::Vaults,
                EntityGroup::Documents,
                EntityGroup::ComplianceRecords
            ]
        );
        assert_eq!(coordinator.status().await, SyncStatus::Synced);
        assert_eq!(coordinator.progress().await, 0.0);
        assert!(coordinator.last_sync_time().await.unwrap() >= started);
    }

    #[tokio::test]
    async fn test_missing_persistence() {
        let coordinator = SyncCoordinator::new(online_config());

        assert!(matches!(
            coordinator.perform_sync().await,
            Err(Error::PersistenceUnavailable)
        ));
        assert!(matches!(
            coordinator
                .resolve_conflict(&id("doc-1"), ConflictStrategy::ServerWins)
                .await,
            Err(Error::PersistenceUnavailable)
        ));
        assert_eq!(coordinator.status().await, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_phase_failure_stops_pass_without_rollback() {
        let store = MemoryStore::new();
        store
            .put_record(RevisionRecord::in_sync(id("vault-1"), EntityGroup::Vaults, "r1"))
            .await;
        let vault_rev = store.modify_local(&id("vault-1"), EntityGroup::Vaults).await;
        store.fail_group(EntityGroup::Documents, "remote rejected").await;

        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store.clone()));
        let err = coordinator.perform_sync().await.unwrap_err();

        match err {
            Error::SyncPhase { phase, .. } => assert_eq!(phase, "documents"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(coordinator.status().await, SyncStatus::Error);
        assert_eq!(coordinator.progress().await, 0.0);
        assert!(coordinator.last_sync_time().await.is_none());
        assert_eq!(
            store.save_log().await,
            vec![EntityGroup::Vaults, EntityGroup::Documents]
        );

        // Vault phase stays committed.
        let vault = store.record(&id("vault-1")).await.unwrap();
        assert_eq!(vault.remote_revision.as_deref(), Some(vault_rev.as_str()));

        // A later pass can recover.
        store.clear_failures().await;
        let report = coordinator.perform_sync().await.unwrap();
        assert_eq!(report.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_conflicts_detected_and_resolved() {
        let store = store_with_conflict("doc-1").await;
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store.clone()));

        let report = coordinator.perform_sync().await.unwrap();
        assert_eq!(report.status, SyncStatus::Conflict);
        assert_eq!(report.conflicts_found, 1);
        assert_eq!(coordinator.conflict_count().await, 1);
        assert_eq!(coordinator.progress().await, 0.0);
        assert!(coordinator.last_sync_time().await.is_none());

        let result = coordinator
            .resolve_conflict(&id("doc-1"), ConflictStrategy::ClientWins)
            .await
            .unwrap();
        assert!(matches!(result, ResolutionResult::UsedClient { .. }));
        assert_eq!(coordinator.conflict_count().await, 0);
        assert_eq!(coordinator.status().await, SyncStatus::Synced);
        assert!(coordinator.last_sync_time().await.is_some());
    }

    #[tokio::test]
    async fn test_manual_strategy_keeps_conflict() {
        let store = store_with_conflict("doc-1").await;
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store.clone()));
        coordinator.perform_sync().await.unwrap();

        let result = coordinator
            .resolve_conflict(&id("doc-1"), ConflictStrategy::Manual)
            .await
            .unwrap();
        assert_eq!(result, ResolutionResult::Pending);
        assert_eq!(coordinator.conflict_count().await, 1);
        assert_eq!(coordinator.status().await, SyncStatus::Conflict);
    }

    #[tokio::test]
    async fn test_resolve_all_with_default_strategy() {
        let store = store_with_conflict("doc-1").await;
        store
            .put_record(RevisionRecord::in_sync(id("doc-2"), EntityGroup::Documents, "r1"))
            .await;
        store.modify_local(&id("doc-2"), EntityGroup::Documents).await;
        store.modify_remote(&id("doc-2"), EntityGroup::Documents).await;

        let coordinator = SyncCoordinator::new(CoordinatorConfig {
            default_strategy: ConflictStrategy::Merge,
            ..online_config()
        })
        .with_persistence(Arc::new(store));
        coordinator.perform_sync().await.unwrap();
        assert_eq!(coordinator.conflict_count().await, 2);

        assert_eq!(coordinator.resolve_all().await.unwrap(), 2);
        assert_eq!(coordinator.conflict_count().await, 0);
    }

    #[tokio::test]
    async fn test_resolve_rejects_unknown_or_clean_entity() {
        let store = MemoryStore::new();
        store
            .put_record(RevisionRecord::in_sync(id("clean"), EntityGroup::Vaults, "r1"))
            .await;
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store));

        assert!(matches!(
            coordinator
                .resolve_conflict(&id("missing"), ConflictStrategy::ServerWins)
                .await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            coordinator
                .resolve_conflict(&id("clean"), ConflictStrategy::ServerWins)
                .await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_needs_sync_staleness() {
        let clock = ManualClock::default();
        let coordinator = SyncCoordinator::new(online_config())
            .with_clock(Arc::new(clock.clone()))
            .with_persistence(Arc::new(MemoryStore::new()));

        assert!(coordinator.needs_sync().await);

        coordinator.perform_sync().await.unwrap();
        assert!(!coordinator.needs_sync().await);

        clock.advance(chrono::Duration::seconds(300));
        assert!(!coordinator.needs_sync().await);

        clock.advance(chrono::Duration::seconds(1));
        assert!(coordinator.needs_sync().await);
    }

    #[tokio::test]
    async fn test_connectivity_transitions() {
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(MemoryStore::new()));
        coordinator.perform_sync().await.unwrap();

        coordinator.set_online(false).await;
        assert_eq!(coordinator.status().await, SyncStatus::Offline);

        coordinator.set_online(true).await;
        assert_eq!(coordinator.status().await, SyncStatus::Idle);

        // Reconnecting does not start a pass by itself.
        assert!(coordinator.snapshot().await.is_online);
        assert_eq!(coordinator.progress().await, 0.0);
    }

    #[tokio::test]
    async fn test_configure_refreshes_status() {
        let coordinator = SyncCoordinator::new(CoordinatorConfig::default());
        coordinator.configure(Arc::new(MemoryStore::new())).await;
        assert_eq!(coordinator.status().await, SyncStatus::Offline);

        coordinator.set_online(true).await;
        coordinator.refresh_status().await;
        assert_eq!(coordinator.status().await, SyncStatus::Idle);
    }

    #[tokio::test]
    async fn test_watch_reports_final_snapshot() {
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(MemoryStore::new()));
        let rx = coordinator.watch();

        coordinator.perform_sync().await.unwrap();

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.status, SyncStatus::Synced);
        assert_eq!(snapshot.progress, 0.0);
        assert!(snapshot.last_sync_time.is_some());
    }

    #[tokio::test]
    async fn test_progress_steps_through_phase_boundaries() {
        let (store, mut calls, gate) = GatedStore::new(MemoryStore::new());
        let coordinator =
            Arc::new(SyncCoordinator::new(online_config()).with_persistence(Arc::new(store)));
        let rx = coordinator.watch();
        let pass = spawn_pass(&coordinator);

        let mut seen = Vec::new();
        for call in ["vaults", "documents", "compliance_records", "revisions"] {
            assert_eq!(calls.recv().await.unwrap(), call);
            let snapshot = rx.borrow().clone();
            assert_eq!(snapshot.status, SyncStatus::Syncing);
            seen.push(snapshot.progress);
            gate.add_permits(1);
        }

        let report = pass.await.unwrap().unwrap();
        assert_eq!(seen, vec![0.2, 0.5, 0.7, 0.9]);
        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(rx.borrow().progress, 0.0);
    }

    #[tokio::test]
    async fn test_offline_mid_pass_keeps_final_status() {
        let (store, mut calls, gate) = GatedStore::new(MemoryStore::new());
        let coordinator =
            Arc::new(SyncCoordinator::new(online_config()).with_persistence(Arc::new(store)));
        let pass = spawn_pass(&coordinator);

        assert_eq!(calls.recv().await.unwrap(), "vaults");
        coordinator.set_online(false).await;
        assert_eq!(coordinator.status().await, SyncStatus::Offline);

        gate.add_permits(4);
        let report = pass.await.unwrap().unwrap();
        assert_eq!(report.status, SyncStatus::Synced);
        assert_eq!(coordinator.status().await, SyncStatus::Synced);
        assert!(!coordinator.snapshot().await.is_online);

        // A new pass fails fast.
        let next = coordinator.perform_sync().await.unwrap();
        assert_eq!(next.status, SyncStatus::Offline);
    }

    #[tokio::test]
    async fn test_offline_mid_pass_keeps_error_status() {
        let inner = MemoryStore::new();
        inner.fail_group(EntityGroup::Documents, "remote rejected").await;
        let (store, mut calls, gate) = GatedStore::new(inner);
        let coordinator =
            Arc::new(SyncCoordinator::new(online_config()).with_persistence(Arc::new(store)));
        let pass = spawn_pass(&coordinator);

        assert_eq!(calls.recv().await.unwrap(), "vaults");
        coordinator.set_online(false).await;
        gate.add_permits(4);

        assert!(matches!(
            pass.await.unwrap(),
            Err(Error::SyncPhase { .. })
        ));
        assert_eq!(coordinator.status().await, SyncStatus::Error);
    }

    #[tokio::test]
    async fn test_cancelled_pass_releases_coordinator() {
        let (store, mut calls, gate) = GatedStore::new(MemoryStore::new());
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store));

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), coordinator.perform_sync()).await;
        assert!(cancelled.is_err());
        assert_eq!(calls.recv().await.unwrap(), "vaults");
        assert_eq!(coordinator.status().await, SyncStatus::Idle);
        assert_eq!(coordinator.progress().await, 0.0);

        gate.add_permits(8);
        let report = coordinator.perform_sync().await.unwrap();
        assert!(!report.already_running);
        assert_eq!(report.status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn test_panicking_store_fails_the_phase() {
        let (mut store, _calls, gate) = GatedStore::new(MemoryStore::new());
        store.panic_on = Some(EntityGroup::Documents);
        gate.add_permits(8);
        let coordinator =
            SyncCoordinator::new(online_config()).with_persistence(Arc::new(store));

        match coordinator.perform_sync().await {
            Err(Error::SyncPhase { phase, source }) => {
                assert_eq!(phase, "documents");
                assert!(matches!(*source, Error::Storage(_)));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(coordinator.status().await, SyncStatus::Error);
        assert_eq!(coordinator.progress().await, 0.0);

        // Not wedged: the next call runs a pass of its own.
        let again = coordinator.perform_sync().await;
        assert!(matches!(again, Err(Error::SyncPhase { .. })));
    }
}
