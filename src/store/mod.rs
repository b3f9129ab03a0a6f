//! Relational metadata store abstraction.
//!
//! The [`MetadataStore`] owns one [`StoredRecord`] per synced entity: its
//! internal id, the sync it belongs to, the entity key, and the content hash
//! used for change detection. Every other component reads these rows only
//! through the bulk lookup that populates [`ActionBatch::existing`].
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`bulk_lookup`](MetadataStore::bulk_lookup) | Existence check for a batch of keys, chunked per round trip |
//! | [`apply`](MetadataStore::apply) | Insert / update / delete rows in one transaction |
//! | [`list_for_sync`](MetadataStore::list_for_sync) | Every row of a sync (orphan sweep) |
//! | [`delete_records`](MetadataStore::delete_records) | Remove rows by internal id |
//!
//! Deadlocks must surface as [`MetadataError::Deadlock`] so callers can apply
//! the short deadlock backoff instead of failing the sync.
//!
//! [`ActionBatch::existing`]: crate::models::ActionBatch::existing

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::MetadataError;
use crate::models::{EntityKey, StoredRecord};

pub use memory::InMemoryMetadataStore;
pub use sqlite::SqliteMetadataStore;

/// Default number of keys per lookup round trip.
pub const DEFAULT_LOOKUP_CHUNK: usize = 1000;

/// A new hash for an existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashUpdate {
    pub id: String,
    pub hash: String,
    pub sync_job_id: String,
}

/// All row changes for one batch, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct MetadataChanges {
    pub inserts: Vec<StoredRecord>,
    pub updates: Vec<HashUpdate>,
    /// Internal record ids to remove.
    pub deletes: Vec<String>,
}

impl MetadataChanges {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Fetch the stored rows for `keys` within `sync_id`.
    ///
    /// Implementations issue at most `chunk_size` keys per round trip.
    /// Keys without a row are simply absent from the result.
    async fn bulk_lookup(
        &self,
        sync_id: &str,
        keys: &[EntityKey],
        chunk_size: usize,
    ) -> Result<HashMap<EntityKey, StoredRecord>, MetadataError>;

    /// Apply all changes in a single transaction.
    async fn apply(&self, changes: &MetadataChanges) -> Result<(), MetadataError>;

    async fn list_for_sync(&self, sync_id: &str) -> Result<Vec<StoredRecord>, MetadataError>;

    async fn delete_records(&self, ids: &[String]) -> Result<(), MetadataError>;
}
