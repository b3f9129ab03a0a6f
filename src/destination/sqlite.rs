//! SQLite vector destination.
//!
//! Chunk entities are stored in `vector_chunks` with the dense vector as a
//! little-endian f32 BLOB and the sparse vector as JSON. Chunk text is also
//! indexed in the `vector_chunks_fts` FTS5 table, which is why this
//! destination reports keyword-index support.

use async_trait::async_trait;
use sqlx::SqlitePool;

use crate::embedding::vec_to_blob;
use crate::error::DestinationError;
use crate::models::Entity;

use super::{parent_id, Destination};

pub struct SqliteVectorDestination {
    pool: SqlitePool,
}

impl SqliteVectorDestination {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Lock contention and connection problems are transient; the rest is not.
fn classify(err: sqlx::Error) -> DestinationError {
    match &err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            DestinationError::Unavailable(err.to_string())
        }
        sqlx::Error::Database(db_err)
            if db_err
                .code()
                .and_then(|c| c.parse::<i64>().ok())
                .is_some_and(|c| matches!(c & 0xff, 5 | 6)) =>
        {
            DestinationError::Unavailable(err.to_string())
        }
        _ => DestinationError::Permanent(err.to_string()),
    }
}

#[async_trait]
impl Destination for SqliteVectorDestination {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn supports_keyword_index(&self) -> bool {
        true
    }

    async fn setup(&self) -> Result<(), DestinationError> {
        crate::migrate::apply_schema(&self.pool)
            .await
            .map_err(|e| DestinationError::Permanent(format!("schema setup failed: {e:#}")))
    }

    async fn bulk_insert(&self, entities: &[Entity]) -> Result<(), DestinationError> {
        if entities.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for entity in entities {
            let meta = &entity.system_metadata;
            let dense = meta.vectors.dense.as_deref().ok_or_else(|| {
                DestinationError::Permanent(format!("{} has no dense vector", entity.entity_id))
            })?;
            let sparse_json = meta
                .vectors
                .sparse
                .as_ref()
                .map(|s| serde_json::to_string(s))
                .transpose()
                .map_err(|e| DestinationError::Permanent(e.to_string()))?;
            let payload_json = serde_json::to_string(&entity.fields)
                .map_err(|e| DestinationError::Permanent(e.to_string()))?;
            let text = entity.textual_representation.as_deref().unwrap_or_default();
            let parent = parent_id(entity);
            let sync_id = meta.sync_id.as_deref().unwrap_or_default();

            sqlx::query(
                r#"
                INSERT INTO vector_chunks (id, parent_id, sync_id, entity_type, chunk_index,
                                           text, dense, sparse_json, payload_json, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    parent_id = excluded.parent_id,
                    sync_id = excluded.sync_id,
                    entity_type = excluded.entity_type,
                    chunk_index = excluded.chunk_index,
                    text = excluded.text,
                    dense = excluded.dense,
                    sparse_json = excluded.sparse_json,
                    payload_json = excluded.payload_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&entity.entity_id)
            .bind(parent)
            .bind(sync_id)
            .bind(&entity.entity_type)
            .bind(meta.chunk_index.map(|i| i as i64))
            .bind(text)
            .bind(vec_to_blob(dense))
            .bind(sparse_json)
            .bind(payload_json)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

            sqlx::query("DELETE FROM vector_chunks_fts WHERE chunk_id = ?")
                .bind(&entity.entity_id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
            sqlx::query("INSERT INTO vector_chunks_fts (chunk_id, parent_id, text) VALUES (?, ?, ?)")
                .bind(&entity.entity_id)
                .bind(parent)
                .bind(text)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        tracing::debug!(rows = entities.len(), "wrote vector chunks");
        Ok(())
    }

    async fn bulk_delete_by_parent_ids(
        &self,
        parent_ids: &[String],
        sync_id: &str,
    ) -> Result<(), DestinationError> {
        if parent_ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for parent in parent_ids {
            sqlx::query(
                "DELETE FROM vector_chunks_fts WHERE chunk_id IN \
                 (SELECT id FROM vector_chunks WHERE sync_id = ? AND parent_id = ?)",
            )
            .bind(sync_id)
            .bind(parent)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
            sqlx::query("DELETE FROM vector_chunks WHERE sync_id = ? AND parent_id = ?")
                .bind(sync_id)
                .bind(parent)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn delete_by_sync_id(&self, sync_id: &str) -> Result<(), DestinationError> {
        let mut tx = self.pool.begin().await.map_err(classify)?;
        sqlx::query(
            "DELETE FROM vector_chunks_fts WHERE chunk_id IN \
             (SELECT id FROM vector_chunks WHERE sync_id = ?)",
        )
        .bind(sync_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;
        sqlx::query("DELETE FROM vector_chunks WHERE sync_id = ?")
            .bind(sync_id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}
