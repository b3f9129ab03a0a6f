//! Handler for destinations that chunk and embed on their own.
//!
//! Only the text build runs client-side; destinations receive whole
//! entities with `textual_representation` set.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::destination::Destination;
use crate::error::SyncError;
use crate::models::{Entity, EntityKey, StoredRecord};
use crate::retry::retry_destination;
use crate::text::TextBuilder;

use super::{entity_ids, ActionHandler, HandlerContext, HandlerOutcome};

pub struct SelfProcessingHandler {
    destinations: Vec<Arc<dyn Destination>>,
    text: Arc<TextBuilder>,
}

impl SelfProcessingHandler {
    pub fn new(destinations: Vec<Arc<dyn Destination>>, text: Arc<TextBuilder>) -> Self {
        Self { destinations, text }
    }

    async fn build(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<(Vec<Entity>, HandlerOutcome), SyncError> {
        let built = ctx.cancellable(self.text.build(entities.to_vec())).await?;
        let kept: HashSet<EntityKey> = built.built.iter().map(Entity::key).collect();
        let outcome = HandlerOutcome::from_difference(entities, &kept);
        Ok((built.built, outcome))
    }

    async fn delete_parents(&self, ids: &[String], ctx: &HandlerContext) -> Result<(), SyncError> {
        if ids.is_empty() {
            return Ok(());
        }
        try_join_all(self.destinations.iter().map(|dest| {
            retry_destination(&ctx.destination_retry, &ctx.cancel, dest.name(), || {
                dest.bulk_delete_by_parent_ids(ids, &ctx.sync_id)
            })
        }))
        .await?;
        Ok(())
    }

    async fn insert(&self, entities: &[Entity], ctx: &HandlerContext) -> Result<(), SyncError> {
        if entities.is_empty() {
            return Ok(());
        }
        try_join_all(self.destinations.iter().map(|dest| {
            retry_destination(&ctx.destination_retry, &ctx.cancel, dest.name(), || {
                dest.bulk_insert(entities)
            })
        }))
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ActionHandler for SelfProcessingHandler {
    fn name(&self) -> &str {
        "self-processing"
    }

    async fn handle_inserts(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        let (built, outcome) = self.build(entities, ctx).await?;
        self.insert(&built, ctx).await?;
        Ok(outcome)
    }

    async fn handle_updates(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        let (built, outcome) = self.build(entities, ctx).await?;
        self.delete_parents(&entity_ids(&built), ctx).await?;
        self.insert(&built, ctx).await?;
        Ok(outcome)
    }

    async fn handle_deletes(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<(), SyncError> {
        self.delete_parents(&entity_ids(entities), ctx).await
    }

    async fn handle_orphans(
        &self,
        orphans: &[StoredRecord],
        ctx: &HandlerContext,
    ) -> Result<(), SyncError> {
        let ids: Vec<String> = orphans.iter().map(|r| r.entity_id.clone()).collect();
        self.delete_parents(&ids, ctx).await
    }
}
