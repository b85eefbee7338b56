//! Persistence collaborator trait definition.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use docvault_common::{EntityId, Result};

/// Group of entities committed together by one sync phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityGroup {
    /// Vault containers.
    Vaults,
    /// Documents stored in vaults.
    Documents,
    /// Compliance and audit records.
    ComplianceRecords,
}

impl EntityGroup {
    /// All groups, in sync order.
    pub const ALL: [EntityGroup; 3] = [
        EntityGroup::Vaults,
        EntityGroup::Documents,
        EntityGroup::ComplianceRecords,
    ];

    /// Short lowercase name used in logs and errors.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityGroup::Vaults => "vaults",
            EntityGroup::Documents => "documents",
            EntityGroup::ComplianceRecords => "compliance_records",
        }
    }
}

impl fmt::Display for EntityGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Revision bookkeeping for a single entity.
///
/// Revisions are opaque tokens (etags). `base_revision` is the last revision
/// both sides agreed on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevisionRecord {
    /// Entity this record describes.
    pub entity_id: EntityId,
    /// Group the entity belongs to.
    pub group: EntityGroup,
    /// Current local revision.
    pub local_revision: Option<String>,
    /// Current remote revision (last fetched).
    pub remote_revision: Option<String>,
    /// Last revision known to be on both sides.
    pub base_revision: Option<String>,
    /// Local modification time.
    pub local_modified: DateTime<Utc>,
    /// Remote modification time, if known.
    pub remote_modified: Option<DateTime<Utc>>,
}

impl RevisionRecord {
    /// Create a record for an entity that is identical on both sides.
    pub fn in_sync(entity_id: EntityId, group: EntityGroup, revision: impl Into<String>) -> Self {
        let revision = Some(revision.into());
        let now = Utc::now();
        Self {
            entity_id,
            group,
            local_revision: revision.clone(),
            remote_revision: revision.clone(),
            base_revision: revision,
            local_modified: now,
            remote_modified: Some(now),
        }
    }

    /// Whether the local side moved past the base.
    pub fn local_changed(&self) -> bool {
        self.local_revision != self.base_revision
    }

    /// Whether the remote side moved past the base.
    pub fn remote_changed(&self) -> bool {
        self.remote_revision != self.base_revision
    }
}

/// Outcome to commit for a conflicted entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Adopt the remote revision locally.
    KeepServer,
    /// Push the local revision over the remote one.
    KeepClient,
    /// Combine both revisions into a new one.
    Merge,
}

/// Persistence collaborator for the sync coordinator.
///
/// Implementations wrap the local data store and its remote counterpart.
/// Each call is expected to be atomic from its own perspective; nothing here
/// spans more than one call.
#[async_trait]
pub trait Persistence: Send + Sync {
    /// Get the store name (e.g., "memory", "cloud").
    fn name(&self) -> &str;

    /// Commit pending changes of one entity group.
    ///
    /// # Postconditions
    /// - Non-conflicting local changes of `group` are pushed
    /// - Non-conflicting remote changes of `group` are pulled
    /// - Returns the number of entities committed
    ///
    /// # Errors
    /// - Storage/network failures; nothing from other groups is touched
    async fn save(&self, group: EntityGroup) -> Result<usize>;

    /// Fetch revision records for every tracked entity.
    async fn fetch_revisions(&self) -> Result<Vec<RevisionRecord>>;

    /// Fetch the revision record of a single entity.
    async fn fetch_revision(&self, entity_id: &EntityId) -> Result<Option<RevisionRecord>>;

    /// Commit a conflict resolution for an entity.
    ///
    /// # Errors
    /// - Entity not found
    /// - Storage/network failures
    async fn commit_resolution(&self, entity_id: &EntityId, resolution: Resolution) -> Result<()>;
}
