//! DocVault Sync Core
//!
//! Offline-first durability and synchronization, including:
//! - Network reachability monitoring with deduplicated transitions
//! - A durable, priority-ordered operation queue with bounded retries
//! - A sync coordinator that runs phased passes and tracks conflicts
//! - Manual and periodic sync scheduling

pub mod clock;
pub mod conflict;
pub mod coordinator;
pub mod queue;
pub mod reachability;
pub mod retry;
pub mod scheduler;
pub mod settings;
pub mod state;

// Re-export main types
pub use clock::{Clock, ManualClock, SystemClock};
pub use conflict::{ConflictInfo, ConflictResolver, ConflictStrategy, ResolutionResult};
pub use coordinator::{CoordinatorConfig, SyncCoordinator};
pub use queue::{
    DrainReport, OperationQueue, QueueConfig, QueueEvent, QueueStatus, QueuedOperation,
    UnitOfWork, DEFAULT_MAX_RETRIES,
};
pub use reachability::{
    ConnectivitySource, ManualConnectivity, NetworkReachabilityMonitor, PathStatus, Reachability,
};
pub use retry::BackoffPolicy;
pub use scheduler::{SyncMode, SyncScheduler, SyncSchedulerHandle};
pub use settings::{SyncSettings, SETTINGS_FILENAME};
pub use state::{SyncPhase, SyncReport, SyncSnapshot, SyncStatus, COMPLETE_PROGRESS};
