//! In-memory persistence for testing and simulation.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::persistence::{EntityGroup, Persistence, Resolution, RevisionRecord};
use docvault_common::{EntityId, Error, Result};

#[derive(Debug, Default)]
struct Inner {
    records: BTreeMap<EntityId, RevisionRecord>,
    failures: HashMap<EntityGroup, String>,
    save_log: Vec<EntityGroup>,
}

/// In-memory persistence store.
///
/// Holds one revision record per entity and reconciles them on `save`.
/// Failures can be injected per group to exercise error paths. All data is
/// lost on drop.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a revision record.
    pub async fn put_record(&self, record: RevisionRecord) {
        let mut inner = self.inner.write().await;
        inner.records.insert(record.entity_id.clone(), record);
    }

    /// Record a local edit, returning the new local revision.
    pub async fn modify_local(&self, entity_id: &EntityId, group: EntityGroup) -> String {
        let revision = Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .entry(entity_id.clone())
            .or_insert_with(|| RevisionRecord {
                entity_id: entity_id.clone(),
                group,
                local_revision: None,
                remote_revision: None,
                base_revision: None,
                local_modified: Utc::now(),
                remote_modified: None,
            });
        record.local_revision = Some(revision.clone());
        record.local_modified = Utc::now();
        revision
    }

    /// Record a remote edit, returning the new remote revision.
    pub async fn modify_remote(&self, entity_id: &EntityId, group: EntityGroup) -> String {
        let revision = Uuid::new_v4().to_string();
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .entry(entity_id.clone())
            .or_insert_with(|| RevisionRecord {
                entity_id: entity_id.clone(),
                group,
                local_revision: None,
                remote_revision: None,
                base_revision: None,
                local_modified: Utc::now(),
                remote_modified: None,
            });
        record.remote_revision = Some(revision.clone());
        record.remote_modified = Some(Utc::now());
        revision
    }

    /// Make every `save` of `group` fail with a storage error.
    pub async fn fail_group(&self, group: EntityGroup, message: impl Into<String>) {
        self.inner.write().await.failures.insert(group, message.into());
    }

    /// Remove all injected failures.
    pub async fn clear_failures(&self) {
        self.inner.write().await.failures.clear();
    }

    /// Groups saved so far, in call order (failed saves included).
    pub async fn save_log(&self) -> Vec<EntityGroup> {
        self.inner.read().await.save_log.clone()
    }

    /// Get a record by entity id.
    pub async fn record(&self, entity_id: &EntityId) -> Option<RevisionRecord> {
        self.inner.read().await.records.get(entity_id).cloned()
    }
}

#[async_trait]
impl Persistence for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, group: EntityGroup) -> Result<usize> {
        let mut inner = self.inner.write().await;
        inner.save_log.push(group);

        if let Some(message) = inner.failures.get(&group) {
            return Err(Error::Storage(message.clone()));
        }

        let now = Utc::now();
        let mut committed = 0;
        for record in inner.records.values_mut().filter(|r| r.group == group) {
            match (record.local_changed(), record.remote_changed()) {
                (true, false) => {
                    record.remote_revision = record.local_revision.clone();
                    record.base_revision = record.local_revision.clone();
                    record.remote_modified = Some(now);
                    committed += 1;
                }
                (false, true) => {
                    record.local_revision = record.remote_revision.clone();
                    record.base_revision = record.remote_revision.clone();
                    record.local_modified = now;
                    committed += 1;
                }
                (true, true) if record.local_revision == record.remote_revision => {
                    record.base_revision = record.local_revision.clone();
                    committed += 1;
                }
                // Diverged on both sides, left for conflict resolution.
                _ => {}
            }
        }

        debug!("Saved group {}: {} entities committed", group, committed);
        Ok(committed)
    }

    async fn fetch_revisions(&self) -> Result<Vec<RevisionRecord>> {
        Ok(self.inner.read().await.records.values().cloned().collect())
    }

    async fn fetch_revision(&self, entity_id: &EntityId) -> Result<Option<RevisionRecord>> {
        Ok(self.inner.read().await.records.get(entity_id).cloned())
    }

    async fn commit_resolution(&self, entity_id: &EntityId, resolution: Resolution) -> Result<()> {
        let mut inner = self.inner.write().await;
        let record = inner
            .records
            .get_mut(entity_id)
            .ok_or_else(|| Error::NotFound(format!("No record for entity {}", entity_id)))?;

        let now = Utc::now();
        let revision = match resolution {
            Resolution::KeepServer => record.remote_revision.clone(),
            Resolution::KeepClient => record.local_revision.clone(),
            Resolution::Merge => Some(format!("merge-{}", Uuid::new_v4())),
        };

        record.local_revision = revision.clone();
        record.remote_revision = revision.clone();
        record.base_revision = revision;
        record.local_modified = now;
        record.remote_modified = Some(now);

        debug!("Committed {:?} for entity {}", resolution, entity_id);
        Ok(())
    }
}
