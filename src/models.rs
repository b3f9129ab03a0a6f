//! Core data models that flow through the sync pipeline.
//!
//! An [`Entity`] is one logical record from a source connector. Entities are
//! stamped with [`SystemMetadata`] on entry, hashed, classified into an
//! [`ActionBatch`], and (for vector destinations) multiplied into chunk
//! entities that carry lineage back to their parent. [`StoredRecord`] is the
//! row the metadata store keeps per synced entity.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::SyncError;

/// A polymorphic source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Source-assigned id, unique within `entity_type`.
    pub entity_id: String,
    /// Type tag, e.g. `"Doc"` or `"SlackMessage"`.
    pub entity_type: String,
    /// Stable identifier of the entity's definition. Defaults to the type tag.
    #[serde(default)]
    pub entity_definition_id: String,
    #[serde(default)]
    pub name: String,
    /// Typed payload fields.
    #[serde(default)]
    pub fields: Map<String, Value>,
    /// Payload keys rendered into the embeddable metadata header.
    #[serde(default)]
    pub embeddable_fields: BTreeSet<String>,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub content: EntityContent,
    /// Explicit deletion signal from the source.
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub textual_representation: Option<String>,
    #[serde(default)]
    pub system_metadata: SystemMetadata,
}

/// Lineage entry pointing at an ancestor record in the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub entity_id: String,
    pub name: String,
    pub entity_type: String,
}

/// What kind of content backs an entity. Resolved once at construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityContent {
    /// Plain structured record; all content lives in `fields`.
    #[default]
    Record,
    /// Binary or text attachment that must be converted to text.
    File(FileAttachment),
    /// Source code file, chunked on the code lane.
    Code(CodeFile),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFile {
    #[serde(default)]
    pub local_path: Option<PathBuf>,
    pub language: String,
}

/// Pipeline bookkeeping attached to every entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetadata {
    pub source_name: Option<String>,
    pub sync_id: Option<String>,
    pub sync_job_id: Option<String>,
    pub hash: Option<String>,
    /// Set only on chunk entities.
    pub chunk_index: Option<usize>,
    /// Set only on chunk entities; the parent's `entity_id`.
    pub original_entity_id: Option<String>,
    #[serde(default)]
    pub vectors: EntityVectors,
}

/// Dense vector (always, once embedded) plus optional sparse vector.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityVectors {
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SparseVector {
    pub indices: Vec<u32>,
    pub values: Vec<f32>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        Self {
            entity_id: entity_id.into(),
            entity_definition_id: entity_type.clone(),
            entity_type,
            name: String::new(),
            fields: Map::new(),
            embeddable_fields: BTreeSet::new(),
            breadcrumbs: Vec::new(),
            url: None,
            content: EntityContent::Record,
            deleted: false,
            textual_representation: None,
            system_metadata: SystemMetadata::default(),
        }
    }

    /// A deletion signal for a previously synced entity.
    pub fn deletion(entity_id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        let mut entity = Self::new(entity_id, entity_type);
        entity.deleted = true;
        entity
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Add a payload field that is also rendered into the embeddable header.
    pub fn with_embeddable(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        self.embeddable_fields.insert(key.clone());
        self.fields.insert(key, value.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_breadcrumb(mut self, crumb: Breadcrumb) -> Self {
        self.breadcrumbs.push(crumb);
        self
    }

    pub fn with_file(mut self, local_path: impl Into<PathBuf>, mime_type: Option<&str>) -> Self {
        self.content = EntityContent::File(FileAttachment {
            local_path: Some(local_path.into()),
            mime_type: mime_type.map(str::to_string),
            size: None,
        });
        self
    }

    pub fn with_code(mut self, local_path: impl Into<PathBuf>, language: impl Into<String>) -> Self {
        self.content = EntityContent::Code(CodeFile {
            local_path: Some(local_path.into()),
            language: language.into(),
        });
        self
    }

    /// The definition id, falling back to the type tag when unset.
    pub fn definition_id(&self) -> &str {
        if self.entity_definition_id.is_empty() {
            &self.entity_type
        } else {
            &self.entity_definition_id
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, self.definition_id())
    }

    pub fn hash(&self) -> Option<&str> {
        self.system_metadata.hash.as_deref()
    }

    pub fn has_file_content(&self) -> bool {
        !matches!(self.content, EntityContent::Record)
    }

    pub fn is_code(&self) -> bool {
        matches!(self.content, EntityContent::Code(_))
    }

    pub fn local_path(&self) -> Option<&Path> {
        match &self.content {
            EntityContent::Record => None,
            EntityContent::File(f) => f.local_path.as_deref(),
            EntityContent::Code(c) => c.local_path.as_deref(),
        }
    }

    pub fn code_language(&self) -> Option<&str> {
        match &self.content {
            EntityContent::Code(c) => Some(&c.language),
            _ => None,
        }
    }

    /// Lowercase extension of the backing file, without the dot.
    pub fn file_extension(&self) -> Option<String> {
        self.local_path()
            .and_then(|p| p.extension())
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    pub fn is_chunk(&self) -> bool {
        self.system_metadata.original_entity_id.is_some()
    }

    /// Check the fields every entity must carry before classification.
    pub fn ensure_classifiable(&self) -> Result<(), SyncError> {
        let meta = &self.system_metadata;
        let missing = [
            ("source_name", meta.source_name.is_none()),
            ("sync_id", meta.sync_id.is_none()),
            ("sync_job_id", meta.sync_job_id.is_none()),
            ("entity_type", self.entity_type.is_empty()),
        ]
        .into_iter()
        .filter(|(_, missing)| *missing)
        .map(|(name, _)| name)
        .collect::<Vec<_>>();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::invariant(format!(
                "entity {} is missing {}",
                self.entity_id,
                missing.join(", ")
            )))
        }
    }
}

/// Lookup key for the metadata store: `(entity_id, entity_definition_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_id: String,
    pub entity_definition_id: String,
}

impl EntityKey {
    pub fn new(entity_id: &str, entity_definition_id: &str) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            entity_definition_id: entity_definition_id.to_string(),
        }
    }
}

/// Metadata-store row for one synced entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub id: String,
    pub sync_id: String,
    pub sync_job_id: String,
    pub entity_id: String,
    pub entity_definition_id: String,
    pub hash: String,
}

impl StoredRecord {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.entity_definition_id)
    }
}

/// The classified unit of work for one ingestion slice.
#[derive(Debug, Clone, Default)]
pub struct ActionBatch {
    pub inserts: Vec<Entity>,
    pub updates: Vec<Entity>,
    pub deletes: Vec<Entity>,
    pub keeps: Vec<Entity>,
    /// Persisted rows for every key in the batch that already exists.
    pub existing: HashMap<EntityKey, StoredRecord>,
}

impl ActionBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty()
            && self.updates.is_empty()
            && self.deletes.is_empty()
            && self.keeps.is_empty()
    }

    /// True when any destination or metadata write is required.
    pub fn has_mutations(&self) -> bool {
        !(self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty())
    }

    pub fn existing_for(&self, entity: &Entity) -> Option<&StoredRecord> {
        self.existing.get(&entity.key())
    }

    pub fn len(&self) -> usize {
        self.inserts.len() + self.updates.len() + self.deletes.len() + self.keeps.len()
    }
}
