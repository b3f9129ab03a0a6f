//! End-of-run orphan sweep.
//!
//! Anything stored for this sync that the run never encountered has
//! disappeared from the source. Every handler removes its copy first; the
//! metadata rows go last so a failed sweep is simply retried next run.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;

use crate::dedup::Deduplicator;
use crate::error::SyncError;
use crate::handlers::{ActionHandler, HandlerContext, MetadataHandler};
use crate::models::StoredRecord;
use crate::progress::Action;
use crate::retry::retry_deadlock;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OrphanReport {
    pub removed: usize,
    /// Orphan counts per entity definition.
    pub by_definition: BTreeMap<String, usize>,
}

pub struct OrphanSweeper {
    handlers: Vec<Arc<dyn ActionHandler>>,
    metadata: Arc<MetadataHandler>,
}

impl OrphanSweeper {
    pub fn new(handlers: Vec<Arc<dyn ActionHandler>>, metadata: Arc<MetadataHandler>) -> Self {
        Self { handlers, metadata }
    }

    /// Stored rows of `sync_id` whose key was never encountered.
    pub async fn find(
        &self,
        seen: &Deduplicator,
        ctx: &HandlerContext,
    ) -> Result<Vec<StoredRecord>, SyncError> {
        let store = self.metadata.store();
        let stored = retry_deadlock(&ctx.deadlock_retry, &ctx.cancel, || {
            store.list_for_sync(&ctx.sync_id)
        })
        .await?;
        let encountered = seen.encountered();
        Ok(stored
            .into_iter()
            .filter(|record| !encountered.contains(&record.key()))
            .collect())
    }

    pub async fn sweep(
        &self,
        seen: &Deduplicator,
        ctx: &HandlerContext,
    ) -> Result<OrphanReport, SyncError> {
        let orphans = self.find(seen, ctx).await?;
        if orphans.is_empty() {
            return Ok(OrphanReport::default());
        }
        tracing::info!(sync_id = %ctx.sync_id, orphans = orphans.len(), "removing orphaned entities");

        let results = join_all(self.handlers.iter().map(|handler| {
            let orphans = &orphans;
            async move { (handler, handler.handle_orphans(orphans, ctx).await) }
        }))
        .await;

        let mut first_error = None;
        for (handler, result) in results {
            match result {
                Ok(()) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if handler.is_best_effort() => {
                    tracing::warn!(handler = handler.name(), error = %e, "orphan cleanup failed, continuing");
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let removed = self.metadata.remove(&orphans, ctx).await?;

        let mut by_definition: BTreeMap<String, usize> = BTreeMap::new();
        for record in &orphans {
            *by_definition
                .entry(record.entity_definition_id.clone())
                .or_default() += 1;
        }
        for (definition, n) in &by_definition {
            ctx.stats.record(Action::Deleted, definition, *n as u64);
        }

        Ok(OrphanReport {
            removed,
            by_definition,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{Destination, InMemoryDestination};
    use crate::error::DestinationError;
    use crate::handlers::SelfProcessingHandler;
    use crate::extract::ConverterRegistry;
    use crate::models::Entity;
    use crate::store::InMemoryMetadataStore;
    use crate::text::TextBuilder;

    fn row(id: &str) -> StoredRecord {
        StoredRecord {
            id: format!("row-{id}"),
            sync_id: "s1".into(),
            sync_job_id: "job-0".into(),
            entity_id: id.into(),
            entity_definition_id: "Doc".into(),
            hash: "h".into(),
        }
    }

    fn setup(
        dest: Arc<InMemoryDestination>,
        store: Arc<InMemoryMetadataStore>,
    ) -> OrphanSweeper {
        let handler = SelfProcessingHandler::new(
            vec![dest as Arc<dyn Destination>],
            Arc::new(TextBuilder::new(Arc::new(ConverterRegistry::with_defaults()), 10)),
        );
        OrphanSweeper::new(
            vec![Arc::new(handler) as Arc<dyn ActionHandler>],
            Arc::new(MetadataHandler::new(store)),
        )
    }

    #[tokio::test]
    async fn unseen_records_are_removed() {
        let store = Arc::new(InMemoryMetadataStore::with_records([row("x1"), row("x2"), row("x3")]));
        let dest = Arc::new(InMemoryDestination::new("search").self_processing());
        let sweeper = setup(dest.clone(), store.clone());

        let seen = Deduplicator::new();
        seen.filter(vec![Entity::new("x1", "Doc"), Entity::new("x2", "Doc")]);
        let ctx = HandlerContext::new("s1", "job-1");

        let report = sweeper.sweep(&seen, &ctx).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.by_definition["Doc"], 1);

        let left: Vec<String> = store.records().into_iter().map(|r| r.entity_id).collect();
        assert_eq!(left, vec!["x1", "x2"]);
        assert_eq!(dest.delete_calls(), 1);
        assert_eq!(ctx.stats.snapshot().deleted, 1);
    }

    #[tokio::test]
    async fn handler_failure_keeps_metadata_rows() {
        let store = Arc::new(InMemoryMetadataStore::with_records([row("gone")]));
        let dest = Arc::new(InMemoryDestination::new("search").self_processing());
        dest.fail_next([DestinationError::Permanent("forbidden".into())]);
        let sweeper = setup(dest, store.clone());

        let result = sweeper
            .sweep(&Deduplicator::new(), &HandlerContext::new("s1", "j"))
            .await;
        assert!(matches!(result, Err(SyncError::Destination { .. })));
        assert_eq!(store.records().len(), 1);
    }

    #[tokio::test]
    async fn nothing_to_sweep_when_everything_seen() {
        let store = Arc::new(InMemoryMetadataStore::with_records([row("a")]));
        let dest = Arc::new(InMemoryDestination::new("search").self_processing());
        let sweeper = setup(dest.clone(), store);
        let seen = Deduplicator::new();
        seen.filter(vec![Entity::new("a", "Doc")]);

        let report = sweeper.sweep(&seen, &HandlerContext::new("s1", "j")).await.unwrap();
        assert_eq!(report, OrphanReport::default());
        assert_eq!(dest.delete_calls(), 0);
    }
}
