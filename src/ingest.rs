//! Ingestion pipeline orchestration.
//!
//! ```text
//! source ──▶ stamp + validate ──▶ dedup ──▶ hash ──▶ classify ──▶ dispatch
//!                                                                  │
//!                     handlers (vector / self-processing / raw) ◀──┤
//!                     metadata commit (last)                    ◀──┘
//! finish ──▶ orphan sweep
//! ```
//!
//! [`EntityPipeline`] processes one slice of entities at a time. Slices may
//! run concurrently; the deduplicator is the only state they share.
//! [`run_sync`] wires the configured collaborators for the CLI.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chunk::ChunkMultiplier;
use crate::config::Config;
use crate::db;
use crate::dedup::Deduplicator;
use crate::destination::{
    Destination, FsArchive, InMemoryDestination, ProcessingRequirement, SqliteVectorDestination,
};
use crate::dispatch::Dispatcher;
use crate::embedding::{create_provider, create_sparse_provider, Embedder};
use crate::error::SyncError;
use crate::extract::ConverterRegistry;
use crate::handlers::{
    ActionHandler, CommitCounts, HandlerContext, MetadataHandler, RawDataHandler,
    SelfProcessingHandler, VectorHandler,
};
use crate::hashing::ContentHasher;
use crate::migrate;
use crate::models::Entity;
use crate::orphans::{OrphanReport, OrphanSweeper};
use crate::progress::{Action, SyncCounters, SyncProgressEvent, SyncProgressReporter, SyncStats};
use crate::resolver::ActionResolver;
use crate::retry::RetryPolicy;
use crate::sources::EntitySource;
use crate::store::{MetadataStore, SqliteMetadataStore, DEFAULT_LOOKUP_CHUNK};
use crate::text::TextBuilder;

/// Identity of one sync run.
#[derive(Debug, Clone)]
pub struct SyncContext {
    pub source_name: String,
    /// Stable across runs of the same sync; scopes every stored row.
    pub sync_id: String,
    /// Unique per run.
    pub sync_job_id: String,
    pub cancel: CancellationToken,
}

impl SyncContext {
    /// A new run with a fresh job id.
    pub fn new(source_name: impl Into<String>, sync_id: impl Into<String>) -> Self {
        Self {
            source_name: source_name.into(),
            sync_id: sync_id.into(),
            sync_job_id: Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Tuning knobs for [`EntityPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub hash_concurrency: usize,
    pub lookup_chunk_size: usize,
    pub destination_retry: RetryPolicy,
    pub deadlock_retry: RetryPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            hash_concurrency: 10,
            lookup_chunk_size: DEFAULT_LOOKUP_CHUNK,
            destination_retry: RetryPolicy::destination(),
            deadlock_retry: RetryPolicy::deadlock(),
        }
    }
}

impl PipelineOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            hash_concurrency: config.sync.hash_concurrency,
            lookup_chunk_size: config.sync.lookup_chunk_size,
            destination_retry: config.retry.destination_policy(),
            deadlock_retry: config.retry.deadlock_policy(),
        }
    }
}

/// Final counters of a run, reported whether it succeeded or not.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub sync_id: String,
    pub sync_job_id: String,
    pub counters: SyncCounters,
    pub by_type: BTreeMap<String, SyncCounters>,
    pub orphans_removed: usize,
    pub error: Option<String>,
}

pub struct EntityPipeline {
    ctx: SyncContext,
    handler_ctx: HandlerContext,
    dedup: Deduplicator,
    hasher: ContentHasher,
    resolver: ActionResolver,
    dispatcher: Dispatcher,
    sweeper: OrphanSweeper,
}

impl EntityPipeline {
    pub fn new(
        ctx: SyncContext,
        store: Arc<dyn MetadataStore>,
        handlers: Vec<Arc<dyn ActionHandler>>,
        options: PipelineOptions,
    ) -> Self {
        let handler_ctx = HandlerContext {
            sync_id: ctx.sync_id.clone(),
            sync_job_id: ctx.sync_job_id.clone(),
            cancel: ctx.cancel.clone(),
            destination_retry: options.destination_retry,
            deadlock_retry: options.deadlock_retry,
            stats: Arc::new(SyncStats::new()),
        };
        let metadata = Arc::new(MetadataHandler::new(Arc::clone(&store)));

        Self {
            handler_ctx,
            dedup: Deduplicator::new(),
            hasher: ContentHasher::new(options.hash_concurrency),
            resolver: ActionResolver::new(store, options.lookup_chunk_size),
            dispatcher: Dispatcher::new(handlers.clone(), Arc::clone(&metadata)),
            sweeper: OrphanSweeper::new(handlers, metadata),
            ctx,
        }
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn stats(&self) -> &Arc<SyncStats> {
        &self.handler_ctx.stats
    }

    /// Run one slice of entities through the pipeline.
    pub async fn process(&self, entities: Vec<Entity>) -> Result<CommitCounts, SyncError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let mut stamped = Vec::with_capacity(entities.len());
        for entity in entities {
            let entity = self.stamp(entity);
            entity.ensure_classifiable()?;
            stamped.push(entity);
        }

        let deduped = self.dedup.filter(stamped);
        for entity in &deduped.duplicates {
            self.stats().record(Action::Skipped, &entity.entity_type, 1);
        }

        let hashed = self
            .handler_ctx
            .cancellable(async { Ok(self.hasher.hash_batch(deduped.unique).await) })
            .await?;
        for (entity, _) in &hashed.failed {
            self.stats().record(Action::Skipped, &entity.entity_type, 1);
        }

        let batch = self
            .handler_ctx
            .cancellable(self.resolver.classify(hashed.hashed, &self.ctx.sync_id))
            .await?;
        if batch.is_empty() {
            return Ok(CommitCounts::default());
        }

        self.dispatcher.dispatch(&batch, &self.handler_ctx).await
    }

    /// Remove everything this run did not encounter.
    pub async fn finish(&self) -> Result<OrphanReport, SyncError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        self.sweeper.sweep(&self.dedup, &self.handler_ctx).await
    }

    pub fn summary(&self, orphans_removed: usize, error: Option<&SyncError>) -> SyncSummary {
        SyncSummary {
            sync_id: self.ctx.sync_id.clone(),
            sync_job_id: self.ctx.sync_job_id.clone(),
            counters: self.stats().snapshot(),
            by_type: self.stats().by_type(),
            orphans_removed,
            error: error.map(ToString::to_string),
        }
    }

    fn stamp(&self, mut entity: Entity) -> Entity {
        let meta = &mut entity.system_metadata;
        if meta.source_name.is_none() {
            meta.source_name = Some(self.ctx.source_name.clone());
        }
        meta.sync_id = Some(self.ctx.sync_id.clone());
        meta.sync_job_id = Some(self.ctx.sync_job_id.clone());
        if entity.entity_definition_id.is_empty() {
            entity.entity_definition_id = entity.entity_type.clone();
        }
        entity
    }
}

/// Build the handler set for the configured destinations.
pub async fn build_handlers(
    config: &Config,
    pool: &sqlx::SqlitePool,
) -> Result<Vec<Arc<dyn ActionHandler>>> {
    let destinations: Vec<Arc<dyn Destination>> = match config.destinations.vector.as_str() {
        "sqlite" => vec![Arc::new(SqliteVectorDestination::new(pool.clone())) as Arc<dyn Destination>],
        "memory" => vec![Arc::new(InMemoryDestination::new("memory")) as Arc<dyn Destination>],
        "none" => Vec::new(),
        other => bail!("Unknown vector destination: '{}'", other),
    };
    for dest in &destinations {
        dest.setup()
            .await
            .with_context(|| format!("Failed to set up destination '{}'", dest.name()))?;
    }

    let registry = Arc::new(ConverterRegistry::with_defaults());
    let text = Arc::new(TextBuilder::new(registry, config.sync.converter_batch_size));

    let (chunked, self_processing): (Vec<_>, Vec<_>) = destinations
        .into_iter()
        .partition(|d| d.processing() == ProcessingRequirement::ChunksAndEmbeddings);

    let mut handlers: Vec<Arc<dyn ActionHandler>> = Vec::new();
    if !chunked.is_empty() {
        let sparse = if config.embedding.sparse {
            create_sparse_provider(&config.embedding)
        } else {
            None
        };
        let embedder = Embedder::new(create_provider(&config.embedding)?, sparse);
        handlers.push(Arc::new(VectorHandler::new(
            chunked,
            Arc::clone(&text),
            Arc::new(ChunkMultiplier::with_defaults(config.chunking.max_tokens)),
            Arc::new(embedder),
        )));
    }
    if !self_processing.is_empty() {
        handlers.push(Arc::new(SelfProcessingHandler::new(self_processing, text)));
    }
    if let Some(dir) = &config.destinations.archive_dir {
        handlers.push(Arc::new(RawDataHandler::new(Arc::new(FsArchive::new(dir)))));
    }
    Ok(handlers)
}

/// Sync one source end to end.
///
/// Counters are reported through `reporter` even when the run fails; the
/// first fatal error is returned after that.
pub async fn run_sync(
    config: &Config,
    source: &dyn EntitySource,
    sync_id: Option<&str>,
    cancel: CancellationToken,
    reporter: &dyn SyncProgressReporter,
) -> Result<SyncSummary> {
    let pool = db::connect(config).await?;
    migrate::apply_schema(&pool).await?;

    let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::new(pool.clone()));
    let handlers = build_handlers(config, &pool).await?;
    if handlers.is_empty() {
        tracing::warn!("no destinations configured, only metadata will be recorded");
    }

    let ctx = SyncContext::new(source.name(), sync_id.unwrap_or(source.name())).with_cancel(cancel);
    tracing::info!(
        source = %ctx.source_name,
        sync_id = %ctx.sync_id,
        sync_job_id = %ctx.sync_job_id,
        "sync started"
    );
    let pipeline = EntityPipeline::new(ctx, store, handlers, PipelineOptions::from_config(config));

    reporter.report(SyncProgressEvent::Discovering {
        source: source.name().to_string(),
    });
    let result = drive(config, source, &pipeline, reporter).await;

    let (orphans_removed, error) = match result {
        Ok(report) => (report.removed, None),
        Err(e) => (0, Some(e)),
    };
    let mut summary = pipeline.summary(orphans_removed, None);
    summary.error = error.as_ref().map(|e| format!("{:#}", e));
    reporter.report(SyncProgressEvent::Finished {
        source: source.name().to_string(),
        counters: summary.counters,
        error: summary.error.clone(),
    });
    pool.close().await;

    match error {
        Some(e) => Err(e),
        None => {
            tracing::info!(
                inserted = summary.counters.inserted,
                updated = summary.counters.updated,
                deleted = summary.counters.deleted,
                kept = summary.counters.kept,
                skipped = summary.counters.skipped,
                "sync finished"
            );
            Ok(summary)
        }
    }
}

async fn drive(
    config: &Config,
    source: &dyn EntitySource,
    pipeline: &EntityPipeline,
    reporter: &dyn SyncProgressReporter,
) -> Result<OrphanReport> {
    let entities = source
        .scan()
        .await
        .with_context(|| format!("Failed to scan source '{}'", source.name()))?;
    let total = entities.len() as u64;

    let mut done = 0u64;
    for slice in entities.chunks(config.sync.batch_size.max(1)) {
        pipeline.process(slice.to_vec()).await?;
        done += slice.len() as u64;
        reporter.report(SyncProgressEvent::Processing {
            source: source.name().to_string(),
            n: done,
            total,
        });
    }

    let report = pipeline.finish().await?;
    if report.removed > 0 {
        reporter.report(SyncProgressEvent::Swept {
            source: source.name().to_string(),
            orphans: report.removed as u64,
        });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::InMemoryDestination;
    use crate::embedding::HashEmbedder;
    use crate::store::InMemoryMetadataStore;

    fn pipeline(store: Arc<InMemoryMetadataStore>, dest: Arc<InMemoryDestination>) -> EntityPipeline {
        let handler = VectorHandler::new(
            vec![dest as Arc<dyn Destination>],
            Arc::new(TextBuilder::new(Arc::new(ConverterRegistry::with_defaults()), 10)),
            Arc::new(ChunkMultiplier::with_defaults(512)),
            Arc::new(Embedder::new(Arc::new(HashEmbedder::new(8)), None)),
        );
        EntityPipeline::new(
            SyncContext::new("test", "s1"),
            store,
            vec![Arc::new(handler) as Arc<dyn ActionHandler>],
            PipelineOptions::default(),
        )
    }

    #[tokio::test]
    async fn entities_are_stamped_before_classification() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let dest = Arc::new(InMemoryDestination::new("vec"));
        let p = pipeline(store.clone(), dest.clone());

        p.process(vec![Entity::new("a", "Doc").with_embeddable("body", "hi")])
            .await
            .unwrap();

        let stored = dest.entities();
        assert_eq!(stored[0].system_metadata.source_name.as_deref(), Some("test"));
        assert_eq!(stored[0].system_metadata.sync_id.as_deref(), Some("s1"));
        assert_eq!(
            stored[0].system_metadata.sync_job_id.as_deref(),
            Some(p.context().sync_job_id.as_str())
        );
        assert_eq!(store.records()[0].sync_job_id, p.context().sync_job_id);
    }

    #[tokio::test]
    async fn unchanged_entities_are_kept_on_second_pass() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let dest = Arc::new(InMemoryDestination::new("vec"));
        let entity = || Entity::new("a", "Doc").with_embeddable("body", "hi");

        pipeline(store.clone(), dest.clone())
            .process(vec![entity()])
            .await
            .unwrap();
        let second = pipeline(store.clone(), dest.clone());
        second.process(vec![entity()]).await.unwrap();

        let counters = second.stats().snapshot();
        assert_eq!(counters.kept, 1);
        assert_eq!(counters.inserted, 0);
        assert_eq!(dest.insert_calls(), 1);
    }

    #[tokio::test]
    async fn cancelled_run_processes_nothing() {
        let store = Arc::new(InMemoryMetadataStore::new());
        let dest = Arc::new(InMemoryDestination::new("vec"));
        let p = pipeline(store.clone(), dest.clone());
        p.context().cancel.cancel();

        let result = p.process(vec![Entity::new("a", "Doc")]).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
        assert!(dest.ids().is_empty());
        assert!(store.records().is_empty());
    }

    #[tokio::test]
    async fn skipped_entities_are_counted_per_type() {
        let p = pipeline(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryDestination::new("vec")),
        );
        let page = || Entity::new("p", "Page").with_embeddable("body", "page");
        p.process(vec![
            Entity::new("a", "Doc").with_embeddable("body", "hi"),
            Entity::new("a", "Doc").with_embeddable("body", "hi"),
            page(),
            page(),
            Entity::new("f", "File").with_file("/definitely/not/here.txt", None),
        ])
        .await
        .unwrap();

        let summary = p.summary(0, None);
        assert_eq!(summary.counters.skipped, 3);
        assert_eq!(summary.by_type["Doc"].skipped, 1);
        assert_eq!(summary.by_type["Page"].skipped, 1);
        assert_eq!(summary.by_type["File"].skipped, 1);
        let per_type: u64 = summary.by_type.values().map(|c| c.skipped).sum();
        assert_eq!(per_type, summary.counters.skipped);
    }

    #[tokio::test]
    async fn summary_carries_error() {
        let p = pipeline(
            Arc::new(InMemoryMetadataStore::new()),
            Arc::new(InMemoryDestination::new("vec")),
        );
        let summary = p.summary(0, Some(&SyncError::Cancelled));
        assert_eq!(summary.sync_id, "s1");
        assert_eq!(summary.error.as_deref(), Some("sync cancelled"));
    }
}
