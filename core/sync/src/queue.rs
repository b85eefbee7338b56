//! Durable, priority-ordered queue of pending units of work.
//!
//! Operations are drained one at a time in `(priority desc, insertion order)`
//! while the queue is online. A failed operation stays in place with its
//! retry count bumped and is attempted again on a later pass; once it has
//! failed `max_retries + 1` times it is evicted and reported on the event
//! channel.

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use docvault_common::{Error, OperationId, Result};

use crate::reachability::Reachability;
use crate::retry::BackoffPolicy;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Caller-supplied asynchronous action. May be invoked more than once.
pub type UnitOfWork = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A unit of work waiting in the queue.
pub struct QueuedOperation {
    /// Unique id for this enqueue.
    pub id: OperationId,
    /// Diagnostic label.
    pub name: String,
    /// Higher drains first.
    pub priority: i32,
    /// Upper bound on retries after the first attempt.
    pub max_retries: u32,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// When the operation was enqueued.
    pub created_at: DateTime<Utc>,
    /// Per-attempt deadline, overriding the queue default.
    pub timeout: Option<Duration>,
    work: UnitOfWork,
    sequence: u64,
}

impl QueuedOperation {
    /// Create an operation with priority 0 and the default retry bound.
    pub fn new<F, Fut>(name: impl Into<String>, work: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            id: OperationId::new(),
            name: name.into(),
            priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            created_at: Utc::now(),
            timeout: None,
            work: Arc::new(move || work().boxed()),
            sequence: 0,
        }
    }

    /// Set priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry bound.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set a per-attempt deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether the next failure is terminal.
    pub fn is_final_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }
}

impl fmt::Debug for QueuedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedOperation")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("max_retries", &self.max_retries)
            .field("retry_count", &self.retry_count)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Operations kept sorted by `(priority desc, sequence asc)`.
#[derive(Debug, Default)]
pub(crate) struct OperationList {
    entries: Vec<QueuedOperation>,
    next_sequence: u64,
}

impl OperationList {
    /// Insert behind every entry of equal or higher priority.
    pub(crate) fn insert(&mut self, mut operation: QueuedOperation) -> OperationId {
        operation.sequence = self.next_sequence;
        self.next_sequence += 1;
        let id = operation.id;
        let position = self
            .entries
            .partition_point(|e| e.priority >= operation.priority);
        self.entries.insert(position, operation);
        id
    }

    pub(crate) fn get(&self, id: &OperationId) -> Option<&QueuedOperation> {
        self.entries.iter().find(|e| e.id == *id)
    }

    pub(crate) fn get_mut(&mut self, id: &OperationId) -> Option<&mut QueuedOperation> {
        self.entries.iter_mut().find(|e| e.id == *id)
    }

    pub(crate) fn remove(&mut self, id: &OperationId) -> Option<QueuedOperation> {
        let index = self.entries.iter().position(|e| e.id == *id)?;
        Some(self.entries.remove(index))
    }

    pub(crate) fn ids(&self) -> Vec<OperationId> {
        self.entries.iter().map(|e| e.id).collect()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &QueuedOperation> {
        self.entries.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Delay policy before re-draining deferred retries.
    pub backoff: BackoffPolicy,
    /// Deadline applied to operations without their own.
    pub operation_timeout: Option<Duration>,
    /// Capacity of the event channel.
    pub event_capacity: usize,
    /// Initial connectivity assumption before any reachability update.
    pub assume_online: bool,
    /// Drain on enqueue, on reconnect and after backoff. When off, the host
    /// drives `drain` itself.
    pub auto_drain: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            operation_timeout: None,
            event_capacity: 64,
            assume_online: false,
            auto_drain: true,
        }
    }
}

/// Read-only snapshot of the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub total_operations: usize,
    /// Entries with retries left.
    pub pending_operations: usize,
    /// Entries on their final attempt.
    pub failed_operations: usize,
    pub is_online: bool,
    pub is_processing: bool,
}

/// Notification emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// The unit of work succeeded and the entry was removed.
    OperationCompleted { id: OperationId, name: String },
    /// The unit of work failed and will be retried on a later pass.
    OperationDeferred {
        id: OperationId,
        name: String,
        retry_count: u32,
        error: Arc<Error>,
    },
    /// The unit of work failed on its final attempt and the entry was removed.
    OperationExhausted {
        id: OperationId,
        name: String,
        attempts: u32,
        /// `Error::RetryExhausted` wrapping the final failure.
        error: Arc<Error>,
    },
}

impl QueueEvent {
    /// Name of the operation the event is about.
    pub fn name(&self) -> &str {
        match self {
            QueueEvent::OperationCompleted { name, .. }
            | QueueEvent::OperationDeferred { name, .. }
            | QueueEvent::OperationExhausted { name, .. } => name,
        }
    }
}

/// Outcome of one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// False when the call was a no-op.
    pub ran: bool,
    pub completed: usize,
    pub deferred: usize,
    pub exhausted: usize,
    /// Entries left when the pass ended.
    pub remaining: usize,
}

struct QueueState {
    operations: OperationList,
    online: bool,
    processing: bool,
    /// Bumped by `clear` so an in-flight pass can tell its snapshot is stale.
    generation: u64,
    retry_timer: Option<JoinHandle<()>>,
    /// Identifies the timer currently held in `retry_timer`.
    timer_seq: u64,
    /// Consecutive passes that ended with entries left.
    retry_passes: u32,
    passes: u64,
}

impl QueueState {
    fn status(&self) -> QueueStatus {
        let failed = self
            .operations
            .iter()
            .filter(|op| op.retry_count >= op.max_retries)
            .count();
        QueueStatus {
            total_operations: self.operations.len(),
            pending_operations: self.operations.len() - failed,
            failed_operations: failed,
            is_online: self.online,
            is_processing: self.processing,
        }
    }

    fn cancel_retry_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    /// Reserve the slot for a new timer and return its sequence number.
    fn next_timer_seq(&mut self) -> u64 {
        self.cancel_retry_timer();
        self.timer_seq += 1;
        self.timer_seq
    }

    /// Release the slot when the timer `seq` fires. A newer timer stays put.
    fn release_retry_timer(&mut self, seq: u64) {
        if self.timer_seq == seq {
            self.retry_timer = None;
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    config: QueueConfig,
    events: broadcast::Sender<QueueEvent>,
    status_tx: watch::Sender<QueueStatus>,
}

/// Priority-ordered queue of units of work, drained sequentially while online.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct OperationQueue {
    shared: Arc<Shared>,
}

impl OperationQueue {
    /// Create an empty queue.
    pub fn new(config: QueueConfig) -> Self {
        let state = QueueState {
            operations: OperationList::default(),
            online: config.assume_online,
            processing: false,
            generation: 0,
            retry_timer: None,
            timer_seq: 0,
            retry_passes: 0,
            passes: 0,
        };
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (status_tx, _) = watch::channel(state.status());

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                config,
                events,
                status_tx,
            }),
        }
    }

    /// Get the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.shared.config
    }

    /// Add an operation in priority order.
    ///
    /// Starts a background drain when online and idle. Never waits for any
    /// unit of work.
    pub async fn enqueue(&self, mut operation: QueuedOperation) -> OperationId {
        operation.created_at = Utc::now();
        let name = operation.name.clone();
        let priority = operation.priority;

        let (id, should_drain) = {
            let mut state = self.shared.state.lock().await;
            let id = state.operations.insert(operation);
            self.publish(&state);
            (id, state.online && !state.processing)
        };

        info!("Queued operation: {} (priority: {})", name, priority);

        if should_drain && self.shared.config.auto_drain {
            self.spawn_drain();
        }
        id
    }

    /// Run one pass over the queue.
    ///
    /// No-op while another pass is running, while offline, or when empty.
    /// Entries enqueued during the pass wait for the next one.
    pub async fn drain(&self) -> DrainReport {
        let (snapshot, generation) = {
            let mut state = self.shared.state.lock().await;
            if state.processing {
                debug!("Drain already in progress");
                return DrainReport::default();
            }
            if !state.online || state.operations.is_empty() {
                return DrainReport::default();
            }
            state.processing = true;
            state.passes += 1;
            state.cancel_retry_timer();
            self.publish(&state);
            (state.operations.ids(), state.generation)
        };

        info!("Draining {} queued operations", snapshot.len());
        let mut report = DrainReport {
            ran: true,
            ..DrainReport::default()
        };

        for id in snapshot {
            let (work, name, timeout) = {
                let state = self.shared.state.lock().await;
                if state.generation != generation {
                    debug!("Queue cleared during drain");
                    break;
                }
                if !state.online {
                    info!("Network connection lost - pausing drain");
                    break;
                }
                match state.operations.get(&id) {
                    Some(op) => (
                        op.work.clone(),
                        op.name.clone(),
                        op.timeout.or(self.shared.config.operation_timeout),
                    ),
                    None => continue,
                }
            };

            debug!("Processing queued operation: {}", name);
            let outcome = run_unit(work, timeout).await;

            let mut state = self.shared.state.lock().await;
            if state.generation != generation {
                debug!("Discarding outcome of {}: queue was cleared", name);
                break;
            }

            match outcome {
                Ok(()) => {
                    state.operations.remove(&id);
                    report.completed += 1;
                    debug!("Queued operation completed: {}", name);
                    let _ = self
                        .shared
                        .events
                        .send(QueueEvent::OperationCompleted { id, name });
                }
                Err(err) => {
                    let Some(op) = state.operations.get_mut(&id) else {
                        continue;
                    };
                    if op.retry_count < op.max_retries {
                        op.retry_count += 1;
                        report.deferred += 1;
                        warn!(
                            "Queued operation failed (retry {}/{}): {}: {}",
                            op.retry_count, op.max_retries, name, err
                        );
                        let _ = self.shared.events.send(QueueEvent::OperationDeferred {
                            id,
                            name,
                            retry_count: op.retry_count,
                            error: Arc::new(err),
                        });
                    } else {
                        let attempts = op.max_retries + 1;
                        state.operations.remove(&id);
                        report.exhausted += 1;
                        error!(
                            "Queued operation failed after {} attempts: {}: {}",
                            attempts, name, err
                        );
                        let error = Error::RetryExhausted {
                            name: name.clone(),
                            attempts,
                            source: Box::new(err),
                        };
                        let _ = self.shared.events.send(QueueEvent::OperationExhausted {
                            id,
                            name,
                            attempts,
                            error: Arc::new(error),
                        });
                    }
                }
            }
            self.publish(&state);
        }

        let mut state = self.shared.state.lock().await;
        state.processing = false;
        report.remaining = state.operations.len();

        if report.remaining == 0 {
            state.retry_passes = 0;
        } else if state.online && self.shared.config.auto_drain {
            let delay = self
                .shared
                .config
                .backoff
                .delay_for_attempt(state.retry_passes);
            state.retry_passes = state.retry_passes.saturating_add(1);
            debug!(
                "{} operations left, next drain in {:?}",
                report.remaining, delay
            );
            let seq = state.next_timer_seq();
            state.retry_timer = self.spawn_delayed_drain(delay, seq);
        }
        self.publish(&state);

        info!(
            "Drain finished: {} completed, {} deferred, {} exhausted, {} remaining",
            report.completed, report.deferred, report.exhausted, report.remaining
        );
        report
    }

    /// Discard every queued operation without running or reporting it.
    ///
    /// A unit of work already executing is left to finish; its outcome is
    /// ignored.
    pub async fn clear(&self) {
        let mut state = self.shared.state.lock().await;
        let dropped = state.operations.len();
        state.operations.clear();
        state.generation += 1;
        state.retry_passes = 0;
        state.cancel_retry_timer();
        self.publish(&state);
        info!("Cleared {} queued operations", dropped);
    }

    /// Apply a connectivity change.
    ///
    /// A `false -> true` transition starts a drain; going offline keeps every
    /// entry and only stops further draining.
    pub async fn set_online(&self, online: bool) {
        let reconnected = {
            let mut state = self.shared.state.lock().await;
            let was_online = state.online;
            state.online = online;
            if !online {
                state.cancel_retry_timer();
            }
            self.publish(&state);
            !was_online && online
        };

        if reconnected {
            info!("Network connection restored - processing queued operations");
            if self.shared.config.auto_drain {
                self.spawn_drain();
            }
        } else if !online {
            debug!("Network connection lost - operations will be queued");
        }
    }

    /// Forward reachability transitions to this queue.
    ///
    /// Must be called from within a tokio runtime. The returned task ends
    /// when the monitor is dropped.
    pub fn follow(&self, mut reachability: watch::Receiver<Reachability>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            loop {
                let online = reachability.borrow_and_update().is_online();
                queue.set_online(online).await;
                if reachability.changed().await.is_err() {
                    break;
                }
            }
        })
    }

    /// Current status snapshot.
    pub async fn status(&self) -> QueueStatus {
        self.shared.state.lock().await.status()
    }

    /// Status updates, pushed after every mutation.
    pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Subscribe to queue events. Delivery is best-effort.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.shared.events.subscribe()
    }

    /// Names of queued operations in drain order.
    pub async fn pending_names(&self) -> Vec<String> {
        let state = self.shared.state.lock().await;
        state.operations.iter().map(|op| op.name.clone()).collect()
    }

    /// Number of passes that actually ran.
    pub async fn passes(&self) -> u64 {
        self.shared.state.lock().await.passes
    }

    fn publish(&self, state: &QueueState) {
        self.shared.status_tx.send_replace(state.status());
    }

    fn spawn_drain(&self) {
        match Handle::try_current() {
            Ok(runtime) => {
                let queue = self.clone();
                runtime.spawn(async move {
                    queue.drain().await;
                });
            }
            Err(_) => debug!("No runtime available, drain deferred to caller"),
        }
    }

    fn spawn_delayed_drain(&self, delay: Duration, seq: u64) -> Option<JoinHandle<()>> {
        let runtime = Handle::try_current().ok()?;
        let queue = self.clone();
        Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            queue.shared.state.lock().await.release_retry_timer(seq);
            queue.drain().await;
        }))
    }
}

impl Default for OperationQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

/// Run one attempt on its own task so a panic counts as a failure.
///
/// A timed-out attempt is aborted and awaited before returning, so no attempt
/// outlives its slot in the pass.
async fn run_unit(work: UnitOfWork, timeout: Option<Duration>) -> Result<()> {
    let mut attempt = tokio::spawn(work());
    let joined = match timeout {
        Some(limit) => match tokio::time::timeout(limit, &mut attempt).await {
            Ok(joined) => joined,
            Err(_) => {
                attempt.abort();
                let _ = attempt.await;
                return Err(Error::Timeout(limit));
            }
        },
        None => attempt.await,
    };
    joined.map_err(|e| Error::Transient(format!("unit of work aborted: {}", e)))?
}
