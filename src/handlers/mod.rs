//! Action handlers: one per kind of write target.
//!
//! | Handler | Owns | Failure policy |
//! |---------|------|----------------|
//! | [`VectorHandler`] | text build → chunk → embed → vector destinations | fatal |
//! | [`SelfProcessingHandler`] | text build → self-processing destinations | fatal |
//! | [`RawDataHandler`] | raw JSON archive | best effort, logged and swallowed |
//! | [`MetadataHandler`] | metadata store rows | fatal, runs last |
//!
//! The first three implement [`ActionHandler`] and run concurrently under
//! the [`Dispatcher`](crate::dispatch::Dispatcher). The metadata handler has
//! its own single-transaction [`commit`](MetadataHandler::commit) path and
//! only runs once every other handler succeeded.

pub mod metadata;
pub mod raw;
pub mod self_processing;
pub mod vector;

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::SyncError;
use crate::models::{ActionBatch, Entity, EntityKey, StoredRecord};
use crate::progress::SyncStats;
use crate::retry::RetryPolicy;

pub use metadata::{CommitCounts, MetadataHandler};
pub use raw::RawDataHandler;
pub use self_processing::SelfProcessingHandler;
pub use vector::VectorHandler;

/// Per-run state every handler needs.
#[derive(Clone)]
pub struct HandlerContext {
    pub sync_id: String,
    pub sync_job_id: String,
    pub cancel: CancellationToken,
    pub destination_retry: RetryPolicy,
    pub deadlock_retry: RetryPolicy,
    pub stats: Arc<SyncStats>,
}

impl HandlerContext {
    pub fn new(sync_id: impl Into<String>, sync_job_id: impl Into<String>) -> Self {
        Self {
            sync_id: sync_id.into(),
            sync_job_id: sync_job_id.into(),
            cancel: CancellationToken::new(),
            destination_retry: RetryPolicy::destination(),
            deadlock_retry: RetryPolicy::deadlock(),
            stats: Arc::new(SyncStats::new()),
        }
    }

    /// Run `fut` unless the run is cancelled first.
    pub async fn cancellable<T, F>(&self, fut: F) -> Result<T, SyncError>
    where
        F: Future<Output = Result<T, SyncError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SyncError::Cancelled),
            result = fut => result,
        }
    }
}

/// Entities a handler dropped during content processing.
///
/// Skipped entities are excluded from the metadata commit, so the next run
/// sees them as new or changed again.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    pub skipped: HashSet<EntityKey>,
}

impl HandlerOutcome {
    /// Keys of `input` that are missing from `kept`.
    pub fn from_difference(input: &[Entity], kept: &HashSet<EntityKey>) -> Self {
        Self {
            skipped: input
                .iter()
                .map(Entity::key)
                .filter(|k| !kept.contains(k))
                .collect(),
        }
    }

    pub fn merge(&mut self, other: HandlerOutcome) {
        self.skipped.extend(other.skipped);
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Best-effort handlers never fail a batch.
    fn is_best_effort(&self) -> bool {
        false
    }

    async fn handle_inserts(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError>;

    async fn handle_updates(
        &self,
        entities: &[Entity],
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError>;

    async fn handle_deletes(&self, entities: &[Entity], ctx: &HandlerContext)
        -> Result<(), SyncError>;

    /// Remove everything stored for entities that disappeared from the source.
    async fn handle_orphans(
        &self,
        orphans: &[StoredRecord],
        ctx: &HandlerContext,
    ) -> Result<(), SyncError>;

    /// Deletes first, then inserts, then updates.
    async fn handle_batch(
        &self,
        batch: &ActionBatch,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutcome, SyncError> {
        if !batch.deletes.is_empty() {
            self.handle_deletes(&batch.deletes, ctx).await?;
        }
        let mut outcome = HandlerOutcome::default();
        if !batch.inserts.is_empty() {
            outcome.merge(self.handle_inserts(&batch.inserts, ctx).await?);
        }
        if !batch.updates.is_empty() {
            outcome.merge(self.handle_updates(&batch.updates, ctx).await?);
        }
        Ok(outcome)
    }
}

/// Parent entity ids, deduplicated, in input order.
pub(crate) fn entity_ids<'a>(entities: impl IntoIterator<Item = &'a Entity>) -> Vec<String> {
    let mut seen = HashSet::new();
    entities
        .into_iter()
        .filter(|e| seen.insert(e.entity_id.as_str()))
        .map(|e| e.entity_id.clone())
        .collect()
}
