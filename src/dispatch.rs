//! Concurrent dispatch of a classified batch.
//!
//! Every [`ActionHandler`] receives the same [`ActionBatch`] at once. The
//! metadata commit only happens after all of them returned:
//!
//! 1. any handler cancelled → [`SyncError::Cancelled`], nothing committed
//! 2. a non-best-effort handler failed → first such error, nothing committed
//! 3. otherwise → commit metadata (minus skipped entities), record counters
//!
//! A destination failure therefore leaves the metadata store untouched and
//! the next run retries the same entities.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::error::SyncError;
use crate::handlers::{ActionHandler, CommitCounts, HandlerContext, MetadataHandler};
use crate::models::{ActionBatch, Entity, EntityKey};
use crate::progress::Action;

pub struct Dispatcher {
    handlers: Vec<Arc<dyn ActionHandler>>,
    metadata: Arc<MetadataHandler>,
}

impl Dispatcher {
    pub fn new(handlers: Vec<Arc<dyn ActionHandler>>, metadata: Arc<MetadataHandler>) -> Self {
        Self { handlers, metadata }
    }

    pub fn handlers(&self) -> &[Arc<dyn ActionHandler>] {
        &self.handlers
    }

    pub fn metadata(&self) -> &Arc<MetadataHandler> {
        &self.metadata
    }

    pub async fn dispatch(
        &self,
        batch: &ActionBatch,
        ctx: &HandlerContext,
    ) -> Result<CommitCounts, SyncError> {
        let mut skipped: HashSet<EntityKey> = HashSet::new();

        if batch.has_mutations() {
            let results = join_all(
                self.handlers
                    .iter()
                    .map(|handler| async move { (handler, handler.handle_batch(batch, ctx).await) }),
            )
            .await;

            let mut first_error = None;
            let mut cancelled = false;
            for (handler, result) in results {
                match result {
                    Ok(outcome) => skipped.extend(outcome.skipped),
                    Err(e) if e.is_cancelled() => cancelled = true,
                    Err(e) if handler.is_best_effort() => {
                        tracing::warn!(handler = handler.name(), error = %e, "best-effort handler failed");
                    }
                    Err(e) => {
                        tracing::error!(handler = handler.name(), error = %e, "handler failed, metadata not committed");
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                }
            }
            if cancelled {
                return Err(SyncError::Cancelled);
            }
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        let counts = self.metadata.commit(batch, &skipped, ctx).await?;
        record_stats(batch, &skipped, ctx);
        Ok(counts)
    }
}

fn record_stats(batch: &ActionBatch, skipped: &HashSet<EntityKey>, ctx: &HandlerContext) {
    let unless_skipped = |entity: &Entity, action: Action| {
        if skipped.contains(&entity.key()) {
            Action::Skipped
        } else {
            action
        }
    };
    let actions = batch
        .inserts
        .iter()
        .map(|e| (e, unless_skipped(e, Action::Inserted)))
        .chain(batch.updates.iter().map(|e| (e, unless_skipped(e, Action::Updated))))
        .chain(batch.deletes.iter().map(|e| (e, Action::Deleted)))
        .chain(batch.keeps.iter().map(|e| (e, Action::Kept)));

    let mut per_type: BTreeMap<(&str, Action), u64> = BTreeMap::new();
    for (entity, action) in actions {
        *per_type.entry((entity.entity_type.as_str(), action)).or_default() += 1;
    }
    for ((entity_type, action), n) in per_type {
        ctx.stats.record(action, entity_type, n);
    }
}
