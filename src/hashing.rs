//! Content hashing for change detection.
//!
//! The hash is a SHA-256 over a canonical JSON view of an entity's semantic
//! content. Volatile fields (lineage, local paths, signed URLs, pipeline
//! metadata) are excluded so that re-syncing an unchanged record always
//! yields the same digest and is classified as KEEP.
//!
//! # Algorithm
//!
//! 1. Flatten the payload and identity fields into one map.
//! 2. For file-bearing entities, stream the local file through SHA-256 in
//!    8 KiB reads and add the digest as `_content_hash`.
//! 3. Drop volatile keys and tokenized URLs.
//! 4. Canonicalize: sort map keys recursively, keep sequence order.
//! 5. Serialize compactly and return the hex SHA-256 digest.
//!
//! File reads are gated by a semaphore so large batches cannot exhaust
//! file descriptors.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;

use crate::error::ProcessingError;
use crate::models::{Entity, EntityContent};

/// Read size used when streaming file content into the hasher.
pub const FILE_READ_CHUNK: usize = 8 * 1024;

/// Default number of concurrent file reads.
pub const DEFAULT_HASH_CONCURRENCY: usize = 10;

/// Keys never included in the hash view.
const VOLATILE_FIELDS: &[&str] = &[
    "system_metadata",
    "breadcrumbs",
    "local_path",
    "url",
    "textual_representation",
];

/// Query parameters that mark a URL as carrying credentials.
const TOKEN_MARKERS: &[&str] = &[
    "token=",
    "access_token",
    "signature=",
    "sig=",
    "x-amz-signature",
    "x-amz-credential",
];

/// Result of hashing a batch: entities with `hash` set, plus the failures.
#[derive(Debug, Default)]
pub struct HashOutcome {
    pub hashed: Vec<Entity>,
    pub failed: Vec<(Entity, ProcessingError)>,
}

/// Computes stable content hashes. Cheap to clone; clones share the file gate.
#[derive(Clone)]
pub struct ContentHasher {
    file_gate: Arc<Semaphore>,
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_CONCURRENCY)
    }
}

impl ContentHasher {
    pub fn new(max_concurrent_reads: usize) -> Self {
        Self {
            file_gate: Arc::new(Semaphore::new(max_concurrent_reads.max(1))),
        }
    }

    /// Hash one entity.
    pub async fn hash(&self, entity: &Entity) -> Result<String, ProcessingError> {
        let mut view = hash_view(entity);

        if entity.has_file_content() {
            let path = entity
                .local_path()
                .ok_or_else(|| ProcessingError::MissingLocalPath {
                    entity_id: entity.entity_id.clone(),
                })?;
            let digest = self.hash_file(path).await?;
            view.insert("_content_hash".to_string(), Value::String(digest));
        }

        let canonical = canonicalize(Value::Object(view));
        let encoded =
            serde_json::to_string(&canonical).map_err(|source| ProcessingError::Serialize {
                entity_id: entity.entity_id.clone(),
                source,
            })?;

        Ok(hex::encode(Sha256::digest(encoded.as_bytes())))
    }

    /// Hash every entity in the batch as an unordered parallel map.
    ///
    /// Deletion signals are passed through untouched; they are matched by
    /// key, not by content.
    pub async fn hash_batch(&self, entities: Vec<Entity>) -> HashOutcome {
        let mut outcome = HashOutcome::default();
        let mut pending = FuturesUnordered::new();

        for entity in entities {
            if entity.deleted {
                outcome.hashed.push(entity);
                continue;
            }
            pending.push(async move {
                let result = self.hash(&entity).await;
                (entity, result)
            });
        }

        while let Some((mut entity, result)) = pending.next().await {
            match result {
                Ok(hash) => {
                    entity.system_metadata.hash = Some(hash);
                    outcome.hashed.push(entity);
                }
                Err(err) => {
                    tracing::warn!(entity_id = %entity.entity_id, error = %err, "skipping entity: hash failed");
                    outcome.failed.push((entity, err));
                }
            }
        }

        outcome
    }

    async fn hash_file(&self, path: &Path) -> Result<String, ProcessingError> {
        let read_error = |source: std::io::Error| ProcessingError::FileRead {
            path: path.to_path_buf(),
            source,
        };

        let _permit = self
            .file_gate
            .acquire()
            .await
            .map_err(|_| read_error(std::io::Error::other("file read gate closed")))?;

        let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; FILE_READ_CHUNK];
        loop {
            let n = file.read(&mut buf).await.map_err(read_error)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

/// Build the map of fields that participate in the hash.
fn hash_view(entity: &Entity) -> Map<String, Value> {
    let mut view = entity.fields.clone();

    view.insert("entity_id".into(), Value::String(entity.entity_id.clone()));
    view.insert("entity_type".into(), Value::String(entity.entity_type.clone()));
    view.insert(
        "entity_definition_id".into(),
        Value::String(entity.definition_id().to_string()),
    );
    view.insert("name".into(), Value::String(entity.name.clone()));

    match &entity.content {
        EntityContent::Record => {}
        EntityContent::File(file) => {
            if let Some(mime) = &file.mime_type {
                view.insert("mime_type".into(), Value::String(mime.clone()));
            }
            if let Some(size) = file.size {
                view.insert("size".into(), Value::from(size));
            }
        }
        EntityContent::Code(code) => {
            view.insert("language".into(), Value::String(code.language.clone()));
        }
    }

    for key in VOLATILE_FIELDS {
        view.remove(*key);
    }
    view.retain(|_, value| !is_tokenized_url(value));

    view
}

fn is_tokenized_url(value: &Value) -> bool {
    let Value::String(s) = value else {
        return false;
    };
    let lower = s.to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://"))
        && lower.contains('?')
        && TOKEN_MARKERS.iter().any(|m| lower.contains(m))
}

/// Sort object keys recursively. Sequences keep their order.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Breadcrumb;
    use serde_json::json;
    use tempfile::TempDir;

    fn doc() -> Entity {
        Entity::new("x1", "Doc")
            .with_name("Roadmap")
            .with_embeddable("title", "Q3 roadmap")
            .with_field("tags", json!(["b", "a"]))
            .with_field("owner", json!({"name": "kai", "id": 7}))
    }

    #[tokio::test]
    async fn hash_is_stable() {
        let hasher = ContentHasher::default();
        let a = hasher.hash(&doc()).await.unwrap();
        let b = hasher.hash(&doc()).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn field_order_does_not_matter() {
        let hasher = ContentHasher::default();
        let first = Entity::new("x1", "Doc")
            .with_field("a", 1)
            .with_field("b", json!({"y": 2, "x": 1}));
        let second = Entity::new("x1", "Doc")
            .with_field("b", json!({"x": 1, "y": 2}))
            .with_field("a", 1);
        assert_eq!(
            hasher.hash(&first).await.unwrap(),
            hasher.hash(&second).await.unwrap()
        );
    }

    #[tokio::test]
    async fn sequence_order_matters() {
        let hasher = ContentHasher::default();
        let first = Entity::new("x1", "Doc").with_field("tags", json!(["a", "b"]));
        let second = Entity::new("x1", "Doc").with_field("tags", json!(["b", "a"]));
        assert_ne!(
            hasher.hash(&first).await.unwrap(),
            hasher.hash(&second).await.unwrap()
        );
    }

    #[tokio::test]
    async fn changing_content_changes_hash() {
        let hasher = ContentHasher::default();
        let before = hasher.hash(&doc()).await.unwrap();
        let after = hasher
            .hash(&doc().with_embeddable("title", "Q4 roadmap"))
            .await
            .unwrap();
        assert_ne!(before, after);

        let renamed = hasher.hash(&doc().with_name("Plan")).await.unwrap();
        assert_ne!(before, renamed);
    }

    #[tokio::test]
    async fn volatile_fields_are_ignored() {
        let hasher = ContentHasher::default();
        let base = hasher.hash(&doc()).await.unwrap();

        let mut changed = doc()
            .with_url("https://example.com/doc?access_token=abc")
            .with_breadcrumb(Breadcrumb {
                entity_id: "ws1".into(),
                name: "Workspace".into(),
                entity_type: "Workspace".into(),
            });
        changed.system_metadata.sync_id = Some("other".into());
        changed.system_metadata.hash = Some("stale".into());
        changed.textual_representation = Some("rendered".into());
        changed = changed.with_field("download_url", "https://cdn.example.com/f?X-Amz-Signature=1");

        assert_eq!(base, hasher.hash(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn plain_urls_in_payload_still_count() {
        let hasher = ContentHasher::default();
        let base = hasher.hash(&doc()).await.unwrap();
        let changed = doc().with_field("homepage", "https://example.com/about");
        assert_ne!(base, hasher.hash(&changed).await.unwrap());
    }

    #[tokio::test]
    async fn file_content_is_hashed_not_path() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.txt");
        let b = tmp.path().join("nested-b.txt");
        std::fs::write(&a, "same bytes").unwrap();
        std::fs::write(&b, "same bytes").unwrap();

        let hasher = ContentHasher::default();
        let first = Entity::new("f1", "File").with_file(&a, Some("text/plain"));
        let second = Entity::new("f1", "File").with_file(&b, Some("text/plain"));
        assert_eq!(
            hasher.hash(&first).await.unwrap(),
            hasher.hash(&second).await.unwrap()
        );

        std::fs::write(&b, "different bytes").unwrap();
        assert_ne!(
            hasher.hash(&first).await.unwrap(),
            hasher.hash(&second).await.unwrap()
        );
    }

    #[tokio::test]
    async fn large_file_streams_across_reads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("big.bin");
        let bytes: Vec<u8> = (0..(FILE_READ_CHUNK * 3 + 17)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &bytes).unwrap();

        let hasher = ContentHasher::default();
        let digest = hasher.hash_file(&path).await.unwrap();
        assert_eq!(digest, hex::encode(Sha256::digest(&bytes)));
    }

    #[tokio::test]
    async fn missing_path_and_unreadable_file_fail() {
        let hasher = ContentHasher::default();

        let mut no_path = Entity::new("f1", "File").with_file("/unused", None);
        if let EntityContent::File(f) = &mut no_path.content {
            f.local_path = None;
        }
        assert!(matches!(
            hasher.hash(&no_path).await,
            Err(ProcessingError::MissingLocalPath { .. })
        ));

        let missing = Entity::new("f2", "File").with_file("/definitely/not/here.txt", None);
        assert!(matches!(
            hasher.hash(&missing).await,
            Err(ProcessingError::FileRead { .. })
        ));
    }

    #[tokio::test]
    async fn batch_hashes_under_small_gate() {
        let tmp = TempDir::new().unwrap();
        let mut entities = Vec::new();
        for i in 0..25 {
            let path = tmp.path().join(format!("{i}.txt"));
            std::fs::write(&path, format!("file {i}")).unwrap();
            entities.push(Entity::new(format!("f{i}"), "File").with_file(path, None));
        }
        entities.push(Entity::new("broken", "File").with_file(tmp.path().join("nope"), None));
        entities.push(Entity::deletion("gone", "File"));

        let outcome = ContentHasher::new(2).hash_batch(entities).await;
        assert_eq!(outcome.hashed.len(), 26);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0.entity_id, "broken");
        assert!(outcome
            .hashed
            .iter()
            .filter(|e| !e.deleted)
            .all(|e| e.hash().is_some()));
    }

    fn file_entities(dir: &Path, n: usize, size: usize) -> Vec<Entity> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("{i}.bin"));
                std::fs::write(&path, vec![i as u8; size]).unwrap();
                Entity::new(format!("f{i}"), "File").with_file(path, None)
            })
            .collect()
    }

    #[tokio::test]
    async fn file_reads_wait_for_the_gate() {
        let tmp = TempDir::new().unwrap();
        let entities = file_entities(tmp.path(), 8, FILE_READ_CHUNK);
        let hasher = ContentHasher::new(2);

        let held = Arc::clone(&hasher.file_gate)
            .acquire_many_owned(2)
            .await
            .unwrap();
        let batch = tokio::spawn({
            let hasher = hasher.clone();
            async move { hasher.hash_batch(entities).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!batch.is_finished());

        drop(held);
        let outcome = batch.await.unwrap();
        assert_eq!(outcome.hashed.len(), 8);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reads_stay_within_the_gate() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let tmp = TempDir::new().unwrap();
        let entities = file_entities(tmp.path(), 24, FILE_READ_CHUNK * 16);
        let hasher = ContentHasher::new(2);

        let done = Arc::new(AtomicBool::new(false));
        let sampler = tokio::spawn({
            let gate = Arc::clone(&hasher.file_gate);
            let done = Arc::clone(&done);
            async move {
                let mut peak = 0;
                while !done.load(Ordering::SeqCst) {
                    peak = peak.max(2 - gate.available_permits());
                    tokio::task::yield_now().await;
                }
                peak
            }
        });

        let outcome = hasher.hash_batch(entities).await;
        done.store(true, Ordering::SeqCst);
        let peak = sampler.await.unwrap();

        assert_eq!(outcome.hashed.len(), 24);
        assert!(peak <= 2, "{peak} reads in flight");
        assert_eq!(hasher.file_gate.available_permits(), 2);
    }
}
