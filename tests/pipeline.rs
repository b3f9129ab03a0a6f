//! Pipeline scenarios against in-memory collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use entity_sync::chunk::ChunkMultiplier;
use entity_sync::destination::{Destination, FsArchive, InMemoryDestination, RawDataStore};
use entity_sync::embedding::{Embedder, HashEmbedder};
use entity_sync::error::{DestinationError, MetadataError, SyncError};
use entity_sync::config::FilesystemSourceConfig;
use entity_sync::extract::{ConverterRegistry, CODE_EXTENSIONS};
use entity_sync::handlers::{ActionHandler, RawDataHandler, SelfProcessingHandler, VectorHandler};
use entity_sync::ingest::{EntityPipeline, PipelineOptions, SyncContext};
use entity_sync::models::{Entity, EntityKey, StoredRecord};
use entity_sync::retry::RetryPolicy;
use entity_sync::sources::{EntitySource, FilesystemSource};
use entity_sync::store::{InMemoryMetadataStore, MetadataChanges, MetadataStore};
use entity_sync::text::TextBuilder;

/// Metadata store that counts `apply` calls and can fail the first ones
/// with a deadlock.
struct SpyStore {
    inner: InMemoryMetadataStore,
    applies: AtomicUsize,
    deadlocks: AtomicUsize,
}

impl SpyStore {
    fn new() -> Self {
        Self::with_deadlocks(0)
    }

    fn with_deadlocks(n: usize) -> Self {
        Self {
            inner: InMemoryMetadataStore::new(),
            applies: AtomicUsize::new(0),
            deadlocks: AtomicUsize::new(n),
        }
    }

    fn applies(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    fn records(&self) -> Vec<StoredRecord> {
        self.inner.records()
    }
}

#[async_trait]
impl MetadataStore for SpyStore {
    async fn bulk_lookup(
        &self,
        sync_id: &str,
        keys: &[EntityKey],
        chunk_size: usize,
    ) -> Result<HashMap<EntityKey, StoredRecord>, MetadataError> {
        self.inner.bulk_lookup(sync_id, keys, chunk_size).await
    }

    async fn apply(&self, changes: &MetadataChanges) -> Result<(), MetadataError> {
        self.applies.fetch_add(1, Ordering::SeqCst);
        let pending = self.deadlocks.load(Ordering::SeqCst);
        if pending > 0 {
            self.deadlocks.store(pending - 1, Ordering::SeqCst);
            return Err(MetadataError::Deadlock("database is locked".into()));
        }
        self.inner.apply(changes).await
    }

    async fn list_for_sync(&self, sync_id: &str) -> Result<Vec<StoredRecord>, MetadataError> {
        self.inner.list_for_sync(sync_id).await
    }

    async fn delete_records(&self, ids: &[String]) -> Result<(), MetadataError> {
        self.inner.delete_records(ids).await
    }
}

fn text_builder() -> Arc<TextBuilder> {
    Arc::new(TextBuilder::new(Arc::new(ConverterRegistry::with_defaults()), 10))
}

fn vector_handler(dest: &Arc<InMemoryDestination>) -> Arc<dyn ActionHandler> {
    Arc::new(VectorHandler::new(
        vec![Arc::clone(dest) as Arc<dyn Destination>],
        text_builder(),
        Arc::new(ChunkMultiplier::with_defaults(64)),
        Arc::new(Embedder::new(Arc::new(HashEmbedder::new(16)), None)),
    ))
}

fn options() -> PipelineOptions {
    PipelineOptions {
        destination_retry: RetryPolicy::immediate(4),
        deadlock_retry: RetryPolicy::immediate(3),
        ..PipelineOptions::default()
    }
}

fn run(store: &Arc<SpyStore>, handlers: Vec<Arc<dyn ActionHandler>>) -> EntityPipeline {
    EntityPipeline::new(
        SyncContext::new("test", "sync-1"),
        Arc::clone(store) as Arc<dyn MetadataStore>,
        handlers,
        options(),
    )
}

fn doc(id: &str, body: &str) -> Entity {
    Entity::new(id, "Doc")
        .with_name(id)
        .with_embeddable("body", body)
}

fn parents(dest: &InMemoryDestination) -> Vec<String> {
    let mut ids: Vec<String> = dest
        .entities()
        .into_iter()
        .filter_map(|e| e.system_metadata.original_entity_id)
        .collect();
    ids.dedup();
    ids
}

#[tokio::test]
async fn end_to_end_new_entity() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(&store, vec![vector_handler(&dest)]);

    let x1 = Entity::new("x1", "Doc").with_embeddable("body", "hello world");
    assert!(x1.hash().is_none());
    let counts = pipeline.process(vec![x1]).await.unwrap();
    assert_eq!(counts.inserted, 1);

    let chunks = dest.entities();
    assert!(!chunks.is_empty());
    for chunk in &chunks {
        assert_eq!(chunk.system_metadata.original_entity_id.as_deref(), Some("x1"));
        assert!(chunk.system_metadata.chunk_index.is_some());
        assert!(chunk.system_metadata.hash.is_some());
        assert!(chunk.system_metadata.vectors.dense.is_some());
    }

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].entity_id, "x1");
    assert!(!records[0].hash.is_empty());
    assert_eq!(pipeline.stats().snapshot().inserted, 1);
}

#[tokio::test]
async fn orphans_are_swept_after_a_run() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));

    let first = run(&store, vec![vector_handler(&dest)]);
    first
        .process(vec![doc("x1", "a"), doc("x2", "b"), doc("x3", "c")])
        .await
        .unwrap();
    first.finish().await.unwrap();
    assert_eq!(store.records().len(), 3);

    let second = run(&store, vec![vector_handler(&dest)]);
    second
        .process(vec![doc("x1", "a"), doc("x2", "b")])
        .await
        .unwrap();
    let report = second.finish().await.unwrap();

    assert_eq!(report.removed, 1);
    let left: Vec<String> = store.records().into_iter().map(|r| r.entity_id).collect();
    assert_eq!(left, vec!["x1", "x2"]);
    assert_eq!(parents(&dest), vec!["x1", "x2"]);

    let counters = second.stats().snapshot();
    assert_eq!(counters.kept, 2);
    assert_eq!(counters.deleted, 1);
}

#[tokio::test]
async fn destination_failure_never_reaches_metadata() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    dest.fail_next([DestinationError::Permanent("400 bad vector".into())]);

    let pipeline = run(&store, vec![vector_handler(&dest)]);
    let result = pipeline.process(vec![doc("x1", "a")]).await;

    assert!(matches!(result, Err(SyncError::Destination { .. })));
    assert_eq!(store.applies(), 0);
    assert!(store.records().is_empty());
    assert_eq!(dest.insert_calls(), 1, "permanent errors are not retried");
}

#[tokio::test]
async fn failed_run_is_retried_cleanly_next_time() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    dest.fail_next((0..4).map(|_| DestinationError::Unavailable("503".into())));

    let first = run(&store, vec![vector_handler(&dest)]);
    assert!(first.process(vec![doc("x1", "a")]).await.is_err());
    assert_eq!(dest.insert_calls(), 4);
    assert!(store.records().is_empty());

    let second = run(&store, vec![vector_handler(&dest)]);
    second.process(vec![doc("x1", "a")]).await.unwrap();
    assert_eq!(store.records().len(), 1);
    assert_eq!(parents(&dest), vec!["x1"]);
    assert_eq!(second.stats().snapshot().inserted, 1);
}

#[tokio::test]
async fn availability_errors_are_retried_within_a_batch() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    dest.fail_next([
        DestinationError::Unavailable("connection refused".into()),
        DestinationError::Unavailable("timeout".into()),
    ]);

    run(&store, vec![vector_handler(&dest)])
        .process(vec![doc("x1", "a")])
        .await
        .unwrap();
    assert_eq!(dest.insert_calls(), 3);
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn duplicates_are_processed_once() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(&store, vec![vector_handler(&dest)]);

    pipeline
        .process(vec![doc("A", "one"), doc("A", "one")])
        .await
        .unwrap();
    pipeline.process(vec![doc("A", "one")]).await.unwrap();

    assert_eq!(store.records().len(), 1);
    let counters = pipeline.stats().snapshot();
    assert_eq!(counters.inserted, 1);
    assert_eq!(counters.skipped, 2);
    let by_type = pipeline.stats().by_type();
    assert_eq!(by_type["Doc"].skipped, 2);
    assert_eq!(by_type["Doc"].inserted, 1);
}

#[tokio::test]
async fn changed_entities_replace_their_chunks() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    run(&store, vec![vector_handler(&dest)])
        .process(vec![doc("x1", "first version")])
        .await
        .unwrap();
    let old_hash = store.records()[0].hash.clone();

    let second = run(&store, vec![vector_handler(&dest)]);
    second
        .process(vec![doc("x1", "second version")])
        .await
        .unwrap();

    let records = store.records();
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].hash, old_hash);
    assert_eq!(records[0].sync_job_id, second.context().sync_job_id);
    assert!(dest.entities().iter().all(|c| c
        .textual_representation
        .as_deref()
        .is_some_and(|t| t.contains("second version"))));
    assert_eq!(second.stats().snapshot().updated, 1);
}

#[tokio::test]
async fn deletion_signal_removes_everywhere() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    run(&store, vec![vector_handler(&dest)])
        .process(vec![doc("x1", "a"), doc("x2", "b")])
        .await
        .unwrap();

    let second = run(&store, vec![vector_handler(&dest)]);
    second
        .process(vec![Entity::deletion("x1", "Doc"), Entity::deletion("never", "Doc")])
        .await
        .unwrap();

    let left: Vec<String> = store.records().into_iter().map(|r| r.entity_id).collect();
    assert_eq!(left, vec!["x2"]);
    assert_eq!(parents(&dest), vec!["x2"]);
    assert_eq!(second.stats().snapshot().deleted, 1);
}

#[tokio::test]
async fn deadlocks_are_retried() {
    let store = Arc::new(SpyStore::with_deadlocks(2));
    let dest = Arc::new(InMemoryDestination::new("vec"));
    run(&store, vec![vector_handler(&dest)])
        .process(vec![doc("x1", "a")])
        .await
        .unwrap();
    assert_eq!(store.applies(), 3);
    assert_eq!(store.records().len(), 1);
}

#[tokio::test]
async fn deadlocks_beyond_budget_fail_the_batch() {
    let store = Arc::new(SpyStore::with_deadlocks(5));
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let result = run(&store, vec![vector_handler(&dest)])
        .process(vec![doc("x1", "a")])
        .await;
    assert!(matches!(
        result,
        Err(SyncError::Metadata(MetadataError::Deadlock(_)))
    ));
    assert_eq!(store.applies(), 3);
}

struct BrokenArchive;

#[async_trait]
impl RawDataStore for BrokenArchive {
    fn name(&self) -> &str {
        "broken-archive"
    }

    async fn store_entities(&self, _: &str, _: &[Entity]) -> Result<(), DestinationError> {
        Err(DestinationError::Permanent("read-only filesystem".into()))
    }

    async fn delete_entities(&self, _: &str, _: &[EntityKey]) -> Result<(), DestinationError> {
        Err(DestinationError::Permanent("read-only filesystem".into()))
    }
}

#[tokio::test]
async fn raw_archive_failures_do_not_fail_the_batch() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(
        &store,
        vec![
            vector_handler(&dest),
            Arc::new(RawDataHandler::new(Arc::new(BrokenArchive))),
        ],
    );

    pipeline.process(vec![doc("x1", "a")]).await.unwrap();
    assert_eq!(store.records().len(), 1);
    assert_eq!(parents(&dest), vec!["x1"]);
}

#[tokio::test]
async fn raw_archive_mirrors_entities() {
    let tmp = TempDir::new().unwrap();
    let archive = Arc::new(FsArchive::new(tmp.path()));
    let store = Arc::new(SpyStore::new());
    let handlers: Vec<Arc<dyn ActionHandler>> =
        vec![Arc::new(RawDataHandler::new(Arc::clone(&archive) as Arc<dyn RawDataStore>))];

    let first = run(&store, handlers.clone());
    first.process(vec![doc("x1", "a"), doc("x2", "b")]).await.unwrap();
    let x1 = archive.path_for("sync-1", &EntityKey::new("x1", "Doc"));
    let x2 = archive.path_for("sync-1", &EntityKey::new("x2", "Doc"));
    assert!(x1.exists() && x2.exists());

    let second = run(&store, handlers);
    second.process(vec![doc("x1", "a")]).await.unwrap();
    second.finish().await.unwrap();
    assert!(x1.exists());
    assert!(!x2.exists());
}

#[tokio::test]
async fn self_processing_destinations_get_whole_entities() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("search").self_processing());
    let handler: Arc<dyn ActionHandler> = Arc::new(SelfProcessingHandler::new(
        vec![Arc::clone(&dest) as Arc<dyn Destination>],
        text_builder(),
    ));

    run(&store, vec![handler])
        .process(vec![doc("x1", "a")])
        .await
        .unwrap();

    let stored = dest.entities();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].entity_id, "x1");
    assert!(stored[0].system_metadata.vectors.dense.is_none());
    assert!(stored[0].textual_representation.is_some());
}

#[tokio::test]
async fn unreadable_files_are_skipped_not_fatal() {
    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(&store, vec![vector_handler(&dest)]);

    let missing = Entity::new("gone.md", "File").with_file("/nonexistent/gone.md", None);
    pipeline
        .process(vec![missing, doc("x1", "a")])
        .await
        .unwrap();

    let counters = pipeline.stats().snapshot();
    assert_eq!(counters.skipped, 1);
    assert_eq!(counters.inserted, 1);
    let ids: Vec<String> = store.records().into_iter().map(|r| r.entity_id).collect();
    assert_eq!(ids, vec!["x1"]);
}

#[tokio::test]
async fn unsupported_file_types_are_skipped_and_retried_next_run() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("photo.png");
    std::fs::write(&path, [0x89, b'P', b'N', b'G']).unwrap();

    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(&store, vec![vector_handler(&dest)]);
    pipeline
        .process(vec![Entity::new("photo.png", "File").with_file(&path, None)])
        .await
        .unwrap();

    assert!(store.records().is_empty());
    assert!(dest.ids().is_empty());
    assert_eq!(pipeline.stats().snapshot().skipped, 1);
}

#[tokio::test]
async fn every_source_code_extension_reaches_the_destination() {
    let tmp = TempDir::new().unwrap();
    for (i, (ext, _)) in CODE_EXTENSIONS.iter().enumerate() {
        std::fs::write(
            tmp.path().join(format!("file{i}.{ext}")),
            format!("top_level_{i}\n\nsecond_block_{i}\n"),
        )
        .unwrap();
    }
    let source = FilesystemSource::new(FilesystemSourceConfig {
        root: tmp.path().to_path_buf(),
        include_globs: vec!["**/*".into()],
        exclude_globs: Vec::new(),
        follow_symlinks: false,
    });
    let entities = source.scan().await.unwrap();
    assert_eq!(entities.len(), CODE_EXTENSIONS.len());
    assert!(entities.iter().all(|e| e.entity_type == "CodeFile"));

    let store = Arc::new(SpyStore::new());
    let dest = Arc::new(InMemoryDestination::new("vec"));
    let pipeline = run(&store, vec![vector_handler(&dest)]);
    pipeline.process(entities).await.unwrap();

    let counters = pipeline.stats().snapshot();
    assert_eq!(counters.skipped, 0);
    assert_eq!(counters.inserted, CODE_EXTENSIONS.len() as u64);
    assert_eq!(store.records().len(), CODE_EXTENSIONS.len());
}
