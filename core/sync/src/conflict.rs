//! Conflict detection and resolution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use docvault_common::{EntityId, Result};
use docvault_store::{EntityGroup, Persistence, Resolution, RevisionRecord};

/// Conflict resolution strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictStrategy {
    /// Remote version replaces the local one.
    ServerWins,
    /// Local version overwrites the remote one.
    ClientWins,
    /// Both versions are combined by the store.
    Merge,
    /// Leave the conflict for the user.
    Manual,
}

impl ConflictStrategy {
    /// Store-level resolution, if the strategy commits anything.
    pub fn resolution(&self) -> Option<Resolution> {
        match self {
            ConflictStrategy::ServerWins => Some(Resolution::KeepServer),
            ConflictStrategy::ClientWins => Some(Resolution::KeepClient),
            ConflictStrategy::Merge => Some(Resolution::Merge),
            ConflictStrategy::Manual => None,
        }
    }
}

/// Information about a detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictInfo {
    /// Entity in conflict.
    pub entity_id: EntityId,
    /// Group the entity belongs to.
    pub group: EntityGroup,
    /// Local state.
    pub local_revision: Option<String>,
    pub local_modified: DateTime<Utc>,
    /// Remote state.
    pub remote_revision: Option<String>,
    pub remote_modified: Option<DateTime<Utc>>,
    /// Last agreed revision.
    pub base_revision: Option<String>,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
}

impl ConflictInfo {
    /// Create conflict info from a revision record.
    pub fn from_record(record: &RevisionRecord) -> Self {
        Self {
            entity_id: record.entity_id.clone(),
            group: record.group,
            local_revision: record.local_revision.clone(),
            local_modified: record.local_modified,
            remote_revision: record.remote_revision.clone(),
            remote_modified: record.remote_modified,
            base_revision: record.base_revision.clone(),
            detected_at: Utc::now(),
        }
    }
}

/// Result of conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionResult {
    /// Remote version kept.
    UsedServer { revision: Option<String> },
    /// Local version kept.
    UsedClient { revision: Option<String> },
    /// Versions merged by the store.
    Merged,
    /// Conflict still pending (manual resolution needed).
    Pending,
}

/// Conflict detector and resolver.
pub struct ConflictResolver {
    /// Default resolution strategy.
    default_strategy: ConflictStrategy,
}

impl ConflictResolver {
    /// Create a new conflict resolver with default strategy.
    pub fn new(default_strategy: ConflictStrategy) -> Self {
        Self { default_strategy }
    }

    /// Detect if local and remote revisions diverged.
    ///
    /// With a base, both sides must have moved away from it and from each
    /// other. Without one, any two different known revisions conflict.
    pub fn detect_conflict(
        &self,
        local: Option<&str>,
        remote: Option<&str>,
        base: Option<&str>,
    ) -> bool {
        // No conflict if revisions match
        if local == remote {
            return false;
        }

        match base {
            Some(_) => local != base && remote != base,
            None => local.is_some() && remote.is_some(),
        }
    }

    /// Filter records down to conflicts.
    pub fn detect(&self, records: &[RevisionRecord]) -> Vec<ConflictInfo> {
        records
            .iter()
            .filter(|r| {
                self.detect_conflict(
                    r.local_revision.as_deref(),
                    r.remote_revision.as_deref(),
                    r.base_revision.as_deref(),
                )
            })
            .map(ConflictInfo::from_record)
            .collect()
    }

    /// Get the default resolution strategy.
    pub fn default_strategy(&self) -> ConflictStrategy {
        self.default_strategy
    }

    /// Resolve a conflict using the specified strategy.
    pub async fn resolve<P: Persistence + ?Sized>(
        &self,
        conflict: &ConflictInfo,
        persistence: &P,
        strategy: ConflictStrategy,
    ) -> Result<ResolutionResult> {
        let Some(resolution) = strategy.resolution() else {
            debug!("Conflict on {} left for manual resolution", conflict.entity_id);
            return Ok(ResolutionResult::Pending);
        };

        persistence
            .commit_resolution(&conflict.entity_id, resolution)
            .await?;

        Ok(match strategy {
            ConflictStrategy::ServerWins => ResolutionResult::UsedServer {
                revision: conflict.remote_revision.clone(),
            },
            ConflictStrategy::ClientWins => ResolutionResult::UsedClient {
                revision: conflict.local_revision.clone(),
            },
            ConflictStrategy::Merge => ResolutionResult::Merged,
            ConflictStrategy::Manual => ResolutionResult::Pending,
        })
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new(ConflictStrategy::Manual)
    }
}
