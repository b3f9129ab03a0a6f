//! Write targets for synced entities.
//!
//! A [`Destination`] receives either chunk entities with vectors (when its
//! [`processing`](Destination::processing) is
//! [`ProcessingRequirement::ChunksAndEmbeddings`]) or whole entities with
//! only a textual representation ([`ProcessingRequirement::SelfProcessing`]).
//! A [`RawDataStore`] mirrors the raw entities for archival.
//!
//! All writes must be idempotent: inserting an id that already exists
//! overwrites it. Availability problems are reported as
//! [`DestinationError::Unavailable`] so the dispatcher can retry them.

pub mod archive;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;

use crate::error::DestinationError;
use crate::models::Entity;

pub use archive::{FsArchive, RawDataStore};
pub use memory::InMemoryDestination;
pub use sqlite::SqliteVectorDestination;

/// What a destination expects the pipeline to do before writing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingRequirement {
    /// Chunk, embed, then write chunk entities.
    ChunksAndEmbeddings,
    /// Write whole entities with text; the destination chunks and embeds.
    SelfProcessing,
}

#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    fn processing(&self) -> ProcessingRequirement {
        ProcessingRequirement::ChunksAndEmbeddings
    }

    /// Whether sparse vectors should be computed for this destination.
    fn supports_keyword_index(&self) -> bool {
        false
    }

    async fn setup(&self) -> Result<(), DestinationError>;

    /// Upsert entities by `entity_id`.
    async fn bulk_insert(&self, entities: &[Entity]) -> Result<(), DestinationError>;

    /// Remove everything derived from the given parent entity ids.
    async fn bulk_delete_by_parent_ids(
        &self,
        parent_ids: &[String],
        sync_id: &str,
    ) -> Result<(), DestinationError>;

    async fn delete_by_sync_id(&self, sync_id: &str) -> Result<(), DestinationError>;
}

/// The id of the entity a written record derives from.
pub fn parent_id(entity: &Entity) -> &str {
    entity
        .system_metadata
        .original_entity_id
        .as_deref()
        .unwrap_or(&entity.entity_id)
}
