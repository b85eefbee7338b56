//! Sync status, phases and snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use docvault_store::EntityGroup;

/// Overall status of the sync coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Ready to sync.
    #[default]
    Idle,
    /// A pass is running.
    Syncing,
    /// Last pass finished cleanly.
    Synced,
    /// Last pass found conflicts.
    Conflict,
    /// Last pass failed.
    Error,
    /// Network unreachable.
    Offline,
}

impl SyncStatus {
    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "Idle",
            SyncStatus::Syncing => "Syncing",
            SyncStatus::Synced => "Synced",
            SyncStatus::Conflict => "Conflict",
            SyncStatus::Error => "Error",
            SyncStatus::Offline => "Offline",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One ordered stage of a sync pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncPhase {
    Vaults,
    Documents,
    ComplianceRecords,
    ConflictCheck,
}

impl SyncPhase {
    /// Phases in execution order.
    pub const ORDER: [SyncPhase; 4] = [
        SyncPhase::Vaults,
        SyncPhase::Documents,
        SyncPhase::ComplianceRecords,
        SyncPhase::ConflictCheck,
    ];

    /// Progress reported when the phase starts.
    pub fn progress(&self) -> f64 {
        match self {
            SyncPhase::Vaults => 0.2,
            SyncPhase::Documents => 0.5,
            SyncPhase::ComplianceRecords => 0.7,
            SyncPhase::ConflictCheck => 0.9,
        }
    }

    /// Entity group committed by this phase.
    pub fn group(&self) -> Option<EntityGroup> {
        match self {
            SyncPhase::Vaults => Some(EntityGroup::Vaults),
            SyncPhase::Documents => Some(EntityGroup::Documents),
            SyncPhase::ComplianceRecords => Some(EntityGroup::ComplianceRecords),
            SyncPhase::ConflictCheck => None,
        }
    }

    /// Short name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Vaults => "vaults",
            SyncPhase::Documents => "documents",
            SyncPhase::ComplianceRecords => "compliance_records",
            SyncPhase::ConflictCheck => "conflict_check",
        }
    }
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress reported once every phase has finished.
pub const COMPLETE_PROGRESS: f64 = 1.0;

/// Observable coordinator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub status: SyncStatus,
    pub progress: f64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub conflict_count: usize,
    pub is_online: bool,
}

/// Result of one `perform_sync` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    /// Status after the call.
    pub status: SyncStatus,
    /// Phases that finished, in order.
    pub phases_completed: Vec<SyncPhase>,
    /// Entities committed across all phases.
    pub entities_committed: usize,
    pub conflicts_found: usize,
    pub duration: Duration,
    /// Another pass was already running; nothing was done.
    pub already_running: bool,
}

impl SyncReport {
    pub(crate) fn skipped(status: SyncStatus, already_running: bool) -> Self {
        Self {
            status,
            phases_completed: Vec::new(),
            entities_committed: 0,
            conflicts_found: 0,
            duration: Duration::ZERO,
            already_running,
        }
    }
}
