//! INSERT / UPDATE / KEEP / DELETE classification.
//!
//! One bulk lookup against the [`MetadataStore`] covers every entity in the
//! slice, deletes included. Non-delete entities are then classified by
//! comparing their fresh hash with the stored one.

use std::sync::Arc;

use crate::error::SyncError;
use crate::models::{ActionBatch, EntityKey, Entity};
use crate::store::MetadataStore;

pub struct ActionResolver {
    store: Arc<dyn MetadataStore>,
    lookup_chunk_size: usize,
}

impl ActionResolver {
    pub fn new(store: Arc<dyn MetadataStore>, lookup_chunk_size: usize) -> Self {
        Self {
            store,
            lookup_chunk_size: lookup_chunk_size.max(1),
        }
    }

    /// Classify `entities` against what is stored for `sync_id`.
    ///
    /// A non-delete entity without a hash fails the sync. A delete signal
    /// for an entity that was never stored is dropped.
    pub async fn classify(
        &self,
        entities: Vec<Entity>,
        sync_id: &str,
    ) -> Result<ActionBatch, SyncError> {
        for entity in entities.iter().filter(|e| !e.deleted) {
            if entity.hash().is_none() {
                return Err(SyncError::invariant(format!(
                    "entity {} reached classification without a hash",
                    entity.entity_id
                )));
            }
        }

        let keys: Vec<EntityKey> = entities.iter().map(Entity::key).collect();
        let existing = self
            .store
            .bulk_lookup(sync_id, &keys, self.lookup_chunk_size)
            .await?;

        let mut batch = ActionBatch::default();
        for entity in entities {
            let stored = existing.get(&entity.key());
            match (entity.deleted, stored) {
                (true, Some(_)) => batch.deletes.push(entity),
                (true, None) => {
                    tracing::debug!(
                        entity_id = %entity.entity_id,
                        "delete signal for unknown entity, ignoring"
                    );
                }
                (false, None) => batch.inserts.push(entity),
                (false, Some(record)) if entity.hash() == Some(record.hash.as_str()) => {
                    batch.keeps.push(entity)
                }
                (false, Some(_)) => batch.updates.push(entity),
            }
        }
        batch.existing = existing;

        tracing::debug!(
            sync_id,
            inserts = batch.inserts.len(),
            updates = batch.updates.len(),
            deletes = batch.deletes.len(),
            keeps = batch.keeps.len(),
            "classified batch"
        );
        Ok(batch)
    }
}
