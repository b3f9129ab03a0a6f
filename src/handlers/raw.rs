//! Best-effort archival mirror.
//!
//! Every failure is logged at `warn` and swallowed, so the archive can never
//! fail a sync. Cancellation still propagates.

use std::sync::Arc;

use async_trait::async_trait;

use crate::destination::RawDataStore;
use crate::error::SyncError;
use crate::models::{Entity, EntityKey, StoredRecord};
use crate::retry::retry_destination;

use super::{ActionHandler, HandlerContext, HandlerOutcome};

pub struct RawDataHandler {
    store: Arc<dyn RawDataStore>,
}

impl RawDataHandler {
    pub fn new(store: Arc<dyn RawDataStore>) -> Self {
        Self { store }
    }

    fn swallow(&self, what: &str, result: Result<(), SyncError>) -> Result<(), SyncError> {
        match result {
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                tracing::warn!(store = self.store.name(), error = %e, "raw data {what} failed, continuing");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn store(&self, entities: &[Entity], ctx: &HandlerContext) -> Result<(), SyncError> {
        let result = retry_destination(&ctx.destination_retry, &ctx.cancel, self.store.name(), || {
            self.store.store_entities(&ctx.sync_id, entities)
        })
        .await;
        self.swallow("write", result)
    }

    async fn delete(&self, keys: &[EntityKey], ctx: &HandlerContext) -> Result<(), SyncError> {
        let result = retry_destination(&ctx.destination_retry, &ctx.cancel, self.store.name(), || {
            self.store.delete_entities(&ctx.sync_id, keys)
        })
        .await;
        self.swallow("delete", result)
    }
}

#[async_trait]
impl ActionHandler for RawDataHandler {
    fn name(&self) -> &str {
        "raw-data"
    }

    fn is_best_effort(&self) -> bool {
        true
    }

    async fn handle_inserts(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        self.store(entities, ctx).await?;
        Ok(HandlerOutcome::default())
    }

    async fn handle_updates(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        self.store(entities, ctx).await?;
        Ok(HandlerOutcome::default())
    }

    async fn handle_deletes(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<(), SyncError> {
        let keys: Vec<EntityKey> = entities.iter().map(Entity::key).collect();
        self.delete(&keys, ctx).await
    }

    async fn handle_orphans(
        &self,
        orphans: &[StoredRecord],
        ctx: &HandlerContext,
    ) -> Result<(), SyncError> {
        let keys: Vec<EntityKey> = orphans.iter().map(StoredRecord::key).collect();
        self.delete(&keys, ctx).await
    }
}
