//! In-memory [`Destination`], keyed by entity id.
//!
//! Used for `vector = "memory"` and throughout the tests. Calls are counted
//! and failures can be queued to exercise retry paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::DestinationError;
use crate::models::Entity;

use super::{parent_id, Destination, ProcessingRequirement};

pub struct InMemoryDestination {
    name: String,
    processing: ProcessingRequirement,
    keyword_index: bool,
    entities: Mutex<BTreeMap<String, Entity>>,
    queued_failures: Mutex<VecDeque<DestinationError>>,
    insert_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryDestination {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            processing: ProcessingRequirement::ChunksAndEmbeddings,
            keyword_index: false,
            entities: Mutex::new(BTreeMap::new()),
            queued_failures: Mutex::new(VecDeque::new()),
            insert_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    pub fn self_processing(mut self) -> Self {
        self.processing = ProcessingRequirement::SelfProcessing;
        self
    }

    pub fn with_keyword_index(mut self) -> Self {
        self.keyword_index = true;
        self
    }

    /// Fail the next write calls, one queued error per call.
    pub fn fail_next(&self, errors: impl IntoIterator<Item = DestinationError>) {
        self.queued_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(errors);
    }

    /// Stored entities ordered by id.
    pub fn entities(&self) -> Vec<Entity> {
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self) -> Result<(), DestinationError> {
        match self
            .queued_failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Destination for InMemoryDestination {
    fn name(&self) -> &str {
        &self.name
    }

    fn processing(&self) -> ProcessingRequirement {
        self.processing
    }

    fn supports_keyword_index(&self) -> bool {
        self.keyword_index
    }

    async fn setup(&self) -> Result<(), DestinationError> {
        Ok(())
    }

    async fn bulk_insert(&self, entities: &[Entity]) -> Result<(), DestinationError> {
        self.insert_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let mut stored = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        for entity in entities {
            stored.insert(entity.entity_id.clone(), entity.clone());
        }
        Ok(())
    }

    async fn bulk_delete_by_parent_ids(
        &self,
        parent_ids: &[String],
        sync_id: &str,
    ) -> Result<(), DestinationError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        let mut stored = self.entities.lock().unwrap_or_else(|e| e.into_inner());
        stored.retain(|_, entity| {
            let same_sync = entity.system_metadata.sync_id.as_deref() == Some(sync_id);
            !(same_sync && parent_ids.iter().any(|p| p == parent_id(entity)))
        });
        Ok(())
    }

    async fn delete_by_sync_id(&self, sync_id: &str) -> Result<(), DestinationError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure()?;
        self.entities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, entity| entity.system_metadata.sync_id.as_deref() != Some(sync_id));
        Ok(())
    }
}
