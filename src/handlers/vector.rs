//! Handler for destinations that store chunk entities with vectors.
//!
//! Batch flow:
//!
//! ```text
//! deletes ──▶ delete-by-parent on every destination
//! inserts + updates ──▶ TextBuilder ──▶ ChunkMultiplier ──▶ Embedder
//!                                                            │
//!        delete-by-parent (surviving updates) ◀──────────────┤
//!        bulk insert (all chunks)             ◀──────────────┘
//! ```
//!
//! Content processing for inserts and updates happens in one pass so the
//! embedding provider sees one call per batch.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;

use crate::chunk::ChunkMultiplier;
use crate::destination::Destination;
use crate::embedding::Embedder;
use crate::error::SyncError;
use crate::models::{ActionBatch, Entity, EntityKey, StoredRecord};
use crate::retry::retry_destination;
use crate::text::TextBuilder;

use super::{entity_ids, ActionHandler, HandlerContext, HandlerOutcome};

pub struct VectorHandler {
    destinations: Vec<Arc<dyn Destination>>,
    text: Arc<TextBuilder>,
    chunker: Arc<ChunkMultiplier>,
    embedder: Arc<Embedder>,
}

/// Chunk entities ready to write, plus the parents that produced them.
struct Processed {
    chunks: Vec<Entity>,
    parents: HashSet<EntityKey>,
}

impl VectorHandler {
    pub fn new(
        destinations: Vec<Arc<dyn Destination>>,
        text: Arc<TextBuilder>,
        chunker: Arc<ChunkMultiplier>,
        embedder: Arc<Embedder>,
    ) -> Self {
        Self {
            destinations,
            text,
            chunker,
            embedder,
        }
    }

    fn keyword_index(&self) -> bool {
        self.destinations.iter().any(|d| d.supports_keyword_index())
    }

    async fn process(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<Processed, SyncError> {
        let built = ctx.cancellable(self.text.build(entities.to_vec())).await?;

        let chunked = ctx.cancellable(self.chunker.chunk(&built.built)).await?;

        let parents: HashSet<EntityKey> = chunked
            .chunks
            .iter()
            .filter_map(|c| {
                c.system_metadata
                    .original_entity_id
                    .as_deref()
                    .map(|parent| EntityKey::new(parent, c.definition_id()))
            })
            .collect();

        let chunks = ctx
            .cancellable(self.embedder.embed(chunked.chunks, self.keyword_index()))
            .await?;

        tracing::debug!(
            parents = parents.len(),
            chunks = chunks.len(),
            "content processed for vector destinations"
        );
        Ok(Processed { chunks, parents })
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

    async fn insert_chunks(&self, chunks: &[Entity], ctx: &HandlerContext) -> Result<(), SyncError> {
        if chunks.is_empty() {
            return Ok(());
        }
        try_join_all(self.destinations.iter().map(|dest| {
            retry_destination(&ctx.destination_retry, &ctx.cancel, dest.name(), || {
                dest.bulk_insert(chunks)
            })
        }))
        .await?;
        Ok(())
    }

    /// Process and write inserts and updates together.
    async fn write(
        &self,
        inserts: &[Entity],
        updates: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        let input: Vec<Entity> = inserts.iter().chain(updates).cloned().collect();
        if input.is_empty() {
            return Ok(HandlerOutcome::default());
        }
        let processed = self.process(&input, ctx).await?;

        let surviving_updates = entity_ids(
            updates
                .iter()
                .filter(|e| processed.parents.contains(&e.key())),
        );
        self.delete_parents(&surviving_updates, ctx).await?;
        self.insert_chunks(&processed.chunks, ctx).await?;

        Ok(HandlerOutcome::from_difference(&input, &processed.parents))
    }
}

#[async_trait]
impl ActionHandler for VectorHandler {
    fn name(&self) -> &str {
        "vector"
    }

    async fn handle_inserts(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        self.write(entities, &[], ctx).await
    }

    async fn handle_updates(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        self.write(&[], entities, ctx).await
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

    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        self.handle_deletes(&batch.deletes, ctx).await?;
        self.write(&batch.inserts, &batch.updates, ctx).await
    }
}
