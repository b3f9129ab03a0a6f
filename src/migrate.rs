use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply_schema(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table used by the metadata store and the SQLite vector
/// destination. Idempotent.
pub async fn apply_schema(pool: &SqlitePool) -> Result<()> {
    // Metadata store: one row per synced entity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS entity_records (
            id TEXT PRIMARY KEY,
            sync_id TEXT NOT NULL,
            sync_job_id TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            entity_definition_id TEXT NOT NULL,
            hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(sync_id, entity_id, entity_definition_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Vector destination: one row per chunk entity
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS vector_chunks (
            id TEXT PRIMARY KEY,
            parent_id TEXT NOT NULL,
            sync_id TEXT NOT NULL,
            entity_type TEXT NOT NULL,
            chunk_index INTEGER,
            text TEXT NOT NULL,
            dense BLOB,
            sparse_json TEXT,
            payload_json TEXT NOT NULL DEFAULT '{}',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='vector_chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE vector_chunks_fts USING fts5(
                chunk_id UNINDEXED,
                parent_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_entity_records_sync ON entity_records(sync_id)")
        .execute(pool)
        .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_vector_chunks_parent ON vector_chunks(sync_id, parent_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
