//! Raw-data archive: a JSON mirror of every synced entity.
//!
//! Layout: `{root}/{sync_id}/{definition_id}/{entity_id}.json`. Path
//! components are sanitized so ids containing separators (relative file
//! paths, URLs) stay inside their directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::DestinationError;
use crate::models::{Entity, EntityKey};

#[async_trait]
pub trait RawDataStore: Send + Sync {
    fn name(&self) -> &str;

    async fn store_entities(&self, sync_id: &str, entities: &[Entity])
        -> Result<(), DestinationError>;

    async fn delete_entities(&self, sync_id: &str, keys: &[EntityKey])
        -> Result<(), DestinationError>;
}

pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, sync_id: &str, key: &EntityKey) -> PathBuf {
        self.root
            .join(sanitize(sync_id))
            .join(sanitize(&key.entity_definition_id))
            .join(format!("{}.json", sanitize(&key.entity_id)))
    }
}

fn sanitize(component: &str) -> String {
    let cleaned: String = component
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => format!("_{cleaned}"),
        _ => cleaned,
    }
}

fn io_error(path: &Path, err: std::io::Error) -> DestinationError {
    DestinationError::Unavailable(format!("{}: {}", path.display(), err))
}

#[async_trait]
impl RawDataStore for FsArchive {
    fn name(&self) -> &str {
        "archive"
    }

    async fn store_entities(
        &self,
        sync_id: &str,
        entities: &[Entity],
    ) -> Result<(), DestinationError> {
        for entity in entities {
            let path = self.path_for(sync_id, &entity.key());
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_error(parent, e))?;
            }
            let json = serde_json::to_vec_pretty(entity)
                .map_err(|e| DestinationError::Permanent(e.to_string()))?;
            tokio::fs::write(&path, json)
                .await
                .map_err(|e| io_error(&path, e))?;
        }
        Ok(())
    }

    async fn delete_entities(
        &self,
        sync_id: &str,
        keys: &[EntityKey],
    ) -> Result<(), DestinationError> {
        for key in keys {
            let path = self.path_for(sync_id, key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(&path, e)),
            }
        }
        Ok(())
    }
}
