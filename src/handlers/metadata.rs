//! Metadata-store commit.
//!
//! Runs after every destination handler succeeded. Inserts, hash updates
//! and deletes for one batch go to the store in a single transaction,
//! retried on deadlock only. Entities a handler skipped are left out so the
//! next run picks them up again.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{ActionBatch, EntityKey, StoredRecord};
use crate::retry::retry_deadlock;
use crate::store::{HashUpdate, MetadataChanges, MetadataStore};

use super::HandlerContext;

/// Rows written by one commit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommitCounts {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

pub struct MetadataHandler {
    store: Arc<dyn MetadataStore>,
}

impl MetadataHandler {
    pub fn new(store: Arc<dyn MetadataStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    fn changes(
        batch: &ActionBatch,
        skipped: &HashSet<EntityKey>,
        ctx: &HandlerContext,
    ) -> Result<MetadataChanges, SyncError> {
        let mut changes = MetadataChanges::default();

        for entity in batch.inserts.iter().filter(|e| !skipped.contains(&e.key())) {
            let hash = entity.hash().ok_or_else(|| {
                SyncError::invariant(format!("insert {} has no hash", entity.entity_id))
            })?;
            changes.inserts.push(StoredRecord {
                id: uuid::Uuid::new_v4().to_string(),
                sync_id: ctx.sync_id.clone(),
                sync_job_id: ctx.sync_job_id.clone(),
                entity_id: entity.entity_id.clone(),
                entity_definition_id: entity.definition_id().to_string(),
                hash: hash.to_string(),
            });
        }

        for entity in batch.updates.iter().filter(|e| !skipped.contains(&e.key())) {
            let record = batch.existing_for(entity).ok_or_else(|| {
                SyncError::invariant(format!(
                    "update {} has no existing metadata row",
                    entity.entity_id
                ))
            })?;
            let hash = entity.hash().ok_or_else(|| {
                SyncError::invariant(format!("update {} has no hash", entity.entity_id))
            })?;
            changes.updates.push(HashUpdate {
                id: record.id.clone(),
                hash: hash.to_string(),
                sync_job_id: ctx.sync_job_id.clone(),
            });
        }

        for entity in &batch.deletes {
            match batch.existing_for(entity) {
                Some(record) => changes.deletes.push(record.id.clone()),
                None => tracing::debug!(
                    entity_id = %entity.entity_id,
                    "delete without metadata row, nothing to remove"
                ),
            }
        }

        Ok(changes)
    }

    /// Persist the outcome of a fully dispatched batch.
    pub async fn commit(
        &self,
        batch: &ActionBatch,
        skipped: &HashSet<EntityKey>,
        ctx: &HandlerContext,
    ) -> Result<CommitCounts, SyncError> {
        let changes = Self::changes(batch, skipped, ctx)?;
        let counts = CommitCounts {
            inserted: changes.inserts.len(),
            updated: changes.updates.len(),
            deleted: changes.deletes.len(),
        };
        if changes.is_empty() {
            return Ok(counts);
        }

        retry_deadlock(&ctx.deadlock_retry, &ctx.cancel, || self.store.apply(&changes)).await?;
        tracing::debug!(
            sync_id = %ctx.sync_id,
            inserted = counts.inserted,
            updated = counts.updated,
            deleted = counts.deleted,
            "metadata committed"
        );
        Ok(counts)
    }

    /// Drop the rows of orphaned entities.
    pub async fn remove(
        &self,
        records: &[StoredRecord],
        ctx: &HandlerContext,
    ) -> Result<usize, SyncError> {
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<String> = records.iter().map(|r| r.id.clone()).collect();
        retry_deadlock(&ctx.deadlock_retry, &ctx.cancel, || {
            self.store.delete_records(&ids)
        })
        .await?;
        Ok(ids.len())
    }
}
