//! In-memory [`MetadataStore`] for tests and dry runs.
//!
//! Rows live in a `HashMap` behind `std::sync::RwLock`. Round trips are
//! counted so callers can observe lookup chunking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::models::{EntityKey, StoredRecord};

use super::{MetadataChanges, MetadataStore};

#[derive(Default)]
pub struct InMemoryMetadataStore {
    records: RwLock<HashMap<String, StoredRecord>>,
    lookup_round_trips: AtomicUsize,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with existing rows.
    pub fn with_records(records: impl IntoIterator<Item = StoredRecord>) -> Self {
        let store = Self::new();
        {
            let mut map = store.records.write().unwrap_or_else(|e| e.into_inner());
            for record in records {
                map.insert(record.id.clone(), record);
            }
        }
        store
    }

    pub fn records(&self) -> Vec<StoredRecord> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<StoredRecord> = map.values().cloned().collect();
        records.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        records
    }

    pub fn lookup_round_trips(&self) -> usize {
        self.lookup_round_trips.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn bulk_lookup(
        &self,
        sync_id: &str,
        keys: &[EntityKey],
        chunk_size: usize,
    ) -> Result<HashMap<EntityKey, StoredRecord>, MetadataError> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        let mut found = HashMap::new();
        for chunk in keys.chunks(chunk_size.max(1)) {
            self.lookup_round_trips.fetch_add(1, Ordering::Relaxed);
            for record in map.values().filter(|r| r.sync_id == sync_id) {
                let key = record.key();
                if chunk.contains(&key) {
                    found.insert(key, record.clone());
                }
            }
        }
        Ok(found)
    }

    async fn apply(&self, changes: &MetadataChanges) -> Result<(), MetadataError> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());

        for update in &changes.updates {
            if !map.contains_key(&update.id) {
                return Err(MetadataError::Other(format!(
                    "no record with id {}",
                    update.id
                )));
            }
        }

        for record in &changes.inserts {
            // Same semantics as the SQL upsert on (sync_id, entity_id, definition).
            let existing_id = map
                .values()
                .find(|r| r.sync_id == record.sync_id && r.key() == record.key())
                .map(|r| r.id.clone());
            match existing_id {
                Some(id) => {
                    if let Some(row) = map.get_mut(&id) {
                        row.hash = record.hash.clone();
                        row.sync_job_id = record.sync_job_id.clone();
                    }
                }
                None => {
                    map.insert(record.id.clone(), record.clone());
                }
            }
        }
        for update in &changes.updates {
            if let Some(row) = map.get_mut(&update.id) {
                row.hash = update.hash.clone();
                row.sync_job_id = update.sync_job_id.clone();
            }
        }
        for id in &changes.deletes {
            map.remove(id);
        }
        Ok(())
    }

    async fn list_for_sync(&self, sync_id: &str) -> Result<Vec<StoredRecord>, MetadataError> {
        let map = self.records.read().unwrap_or_else(|e| e.into_inner());
        let records = map
            .values()
            .filter(|r| r.sync_id == sync_id)
            .cloned()
            .collect();
        Ok(records)
    }

    async fn delete_records(&self, ids: &[String]) -> Result<(), MetadataError> {
        let mut map = self.records.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            map.remove(id);
        }
        Ok(())
    }
}
