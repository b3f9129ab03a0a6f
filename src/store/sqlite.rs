//! SQLite-backed [`MetadataStore`].
//!
//! Rows live in the `entity_records` table created by
//! [`migrate::apply_schema`](crate::migrate::apply_schema). Busy and locked
//! errors are reported as [`MetadataError::Deadlock`].

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use crate::error::MetadataError;
use crate::models::{EntityKey, StoredRecord};

use super::{MetadataChanges, MetadataStore};

/// SQLite primary result codes that indicate lock contention.
const SQLITE_BUSY: i64 = 5;
const SQLITE_LOCKED: i64 = 6;

pub struct SqliteMetadataStore {
    pool: SqlitePool,
}

impl SqliteMetadataStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Map a sqlx error, pulling out lock contention as a deadlock.
fn classify(err: sqlx::Error) -> MetadataError {
    if let sqlx::Error::Database(db_err) = &err {
        let primary = db_err
            .code()
            .and_then(|c| c.parse::<i64>().ok())
            .map(|c| c & 0xff);
        if matches!(primary, Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)) {
            return MetadataError::Deadlock(db_err.message().to_string());
        }
    }
    MetadataError::Database(err)
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<StoredRecord, MetadataError> {
    Ok(StoredRecord {
        id: row.try_get("id").map_err(classify)?,
        sync_id: row.try_get("sync_id").map_err(classify)?,
        sync_job_id: row.try_get("sync_job_id").map_err(classify)?,
        entity_id: row.try_get("entity_id").map_err(classify)?,
        entity_definition_id: row.try_get("entity_definition_id").map_err(classify)?,
        hash: row.try_get("hash").map_err(classify)?,
    })
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn bulk_lookup(
        &self,
        sync_id: &str,
        keys: &[EntityKey],
        chunk_size: usize,
    ) -> Result<HashMap<EntityKey, StoredRecord>, MetadataError> {
        let mut found = HashMap::with_capacity(keys.len());

        for chunk in keys.chunks(chunk_size.max(1)) {
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
                "SELECT id, sync_id, sync_job_id, entity_id, entity_definition_id, hash \
                 FROM entity_records WHERE sync_id = ",
            );
            builder.push_bind(sync_id.to_string());
            builder.push(" AND (entity_id, entity_definition_id) IN (");
            builder.push_values(chunk, |mut b, key| {
                b.push_bind(key.entity_id.clone())
                    .push_bind(key.entity_definition_id.clone());
            });
            builder.push(")");

            let rows = builder
                .build()
                .fetch_all(&self.pool)
                .await
                .map_err(classify)?;
            for row in &rows {
                let record = row_to_record(row)?;
                found.insert(record.key(), record);
            }
        }

        Ok(found)
    }

    async fn apply(&self, changes: &MetadataChanges) -> Result<(), MetadataError> {
        if changes.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await.map_err(classify)?;

        for record in &changes.inserts {
            sqlx::query(
                r#"
                INSERT INTO entity_records (id, sync_id, sync_job_id, entity_id,
                                            entity_definition_id, hash, created_at, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(sync_id, entity_id, entity_definition_id) DO UPDATE SET
                    sync_job_id = excluded.sync_job_id,
                    hash = excluded.hash,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&record.id)
            .bind(&record.sync_id)
            .bind(&record.sync_job_id)
            .bind(&record.entity_id)
            .bind(&record.entity_definition_id)
            .bind(&record.hash)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
        }

        for update in &changes.updates {
            let result = sqlx::query(
                "UPDATE entity_records SET hash = ?, sync_job_id = ?, updated_at = ? WHERE id = ?",
            )
            .bind(&update.hash)
            .bind(&update.sync_job_id)
            .bind(now)
            .bind(&update.id)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;

            if result.rows_affected() == 0 {
                // Dropping `tx` rolls back everything applied so far.
                return Err(MetadataError::Other(format!(
                    "no record with id {}",
                    update.id
                )));
            }
        }

        for id in &changes.deletes {
            sqlx::query("DELETE FROM entity_records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }

        tx.commit().await.map_err(classify)?;
        Ok(())
    }

    async fn list_for_sync(&self, sync_id: &str) -> Result<Vec<StoredRecord>, MetadataError> {
        let rows = sqlx::query(
            "SELECT id, sync_id, sync_job_id, entity_id, entity_definition_id, hash \
             FROM entity_records WHERE sync_id = ? ORDER BY entity_id",
        )
        .bind(sync_id)
        .fetch_all(&self.pool)
        .await
        .map_err(classify)?;

        rows.iter().map(row_to_record).collect()
    }

    async fn delete_records(&self, ids: &[String]) -> Result<(), MetadataError> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await.map_err(classify)?;
        for id in ids {
            sqlx::query("DELETE FROM entity_records WHERE id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(classify)?;
        }
        tx.commit().await.map_err(classify)?;
        Ok(())
    }
}
