//! Database statistics overview.
//!
//! Summarizes what the metadata store and the SQLite vector destination
//! hold: records per sync and definition, chunk counts, and when each sync
//! last wrote. Used by `esync stats`.

use anyhow::Result;
use sqlx::{Row, SqlitePool};

use crate::config::Config;
use crate::db;

/// Per-sync, per-definition breakdown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefinitionStats {
    pub sync_id: String,
    pub entity_definition_id: String,
    pub records: i64,
    pub chunks: i64,
    pub last_write_ts: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total_records: i64,
    pub total_chunks: i64,
    pub embedded_chunks: i64,
    pub definitions: Vec<DefinitionStats>,
}

pub async fn collect(pool: &SqlitePool) -> Result<StoreStats> {
    let total_records: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entity_records")
        .fetch_one(pool)
        .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM vector_chunks")
        .fetch_one(pool)
        .await?;
    let embedded_chunks: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM vector_chunks WHERE dense IS NOT NULL")
            .fetch_one(pool)
            .await?;

    let rows = sqlx::query(
        r#"
        SELECT
            r.sync_id,
            r.entity_definition_id,
            COUNT(*) AS record_count,
            MAX(r.updated_at) AS last_write,
            (
                SELECT COUNT(*) FROM vector_chunks c
                WHERE c.sync_id = r.sync_id AND c.entity_type = r.entity_definition_id
            ) AS chunk_count
        FROM entity_records r
        GROUP BY r.sync_id, r.entity_definition_id
        ORDER BY r.sync_id, record_count DESC
        "#,
    )
    .fetch_all(pool)
    .await?;

    let definitions = rows
        .iter()
        .map(|row| DefinitionStats {
            sync_id: row.get("sync_id"),
            entity_definition_id: row.get("entity_definition_id"),
            records: row.get("record_count"),
            chunks: row.get("chunk_count"),
            last_write_ts: row.get("last_write"),
        })
        .collect();

    Ok(StoreStats {
        total_records,
        total_chunks,
        embedded_chunks,
        definitions,
    })
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    crate::migrate::apply_schema(&pool).await?;
    let stats = collect(&pool).await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("entity-sync: database stats");
    println!("===========================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Records:     {}", stats.total_records);
    println!("  Chunks:      {}", stats.total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        stats.embedded_chunks,
        stats.total_chunks,
        if stats.total_chunks > 0 {
            (stats.embedded_chunks * 100) / stats.total_chunks
        } else {
            0
        }
    );

    if !stats.definitions.is_empty() {
        println!();
        println!("  By sync:");
        println!(
            "  {:<20} {:<20} {:>8} {:>8}   {}",
            "SYNC", "DEFINITION", "RECORDS", "CHUNKS", "LAST WRITE"
        );
        println!("  {}", "-".repeat(76));

        for d in &stats.definitions {
            let written = match d.last_write_ts {
                Some(ts) => format_ts_relative(ts),
                None => "never".to_string(),
            };
            println!(
                "  {:<20} {:<20} {:>8} {:>8}   {}",
                d.sync_id, d.entity_definition_id, d.records, d.chunks, written
            );
        }
    }

    println!();
    pool.close().await;
    Ok(())
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// "3 hours ago" style age of a Unix timestamp.
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    match delta {
        d if d < 0 => format_ts_iso(ts),
        d if d < 60 => "just now".to_string(),
        d if d < 3600 => plural(d / 60, "min"),
        d if d < 86400 => plural(d / 3600, "hour"),
        d if d < 86400 * 30 => plural(d / 86400, "day"),
        _ => format_ts_iso(ts),
    }
}

fn plural(n: i64, unit: &str) -> String {
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
