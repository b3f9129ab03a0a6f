//! # entity-sync CLI (`esync`)
//!
//! ## Usage
//!
//! ```bash
//! esync --config ./config/esync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `esync init` | Create the SQLite database and schema |
//! | `esync sync <source>` | Sync a configured source (`filesystem`, `jsonl`) |
//! | `esync stats` | Show stored records and chunks per sync |
//!
//! Logs go to stderr through `tracing` (`RUST_LOG`, default `info`), so
//! stdout only carries command output.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use entity_sync::config::{self, Config};
use entity_sync::ingest;
use entity_sync::migrate;
use entity_sync::progress::ProgressMode;
use entity_sync::sources::{EntitySource, FilesystemSource, JsonlSource};
use entity_sync::stats;

/// Hash-based entity sync: change detection, chunking, embedding and
/// ordered multi-destination commits.
#[derive(Parser)]
#[command(name = "esync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/esync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Sync a configured source.
    ///
    /// Unchanged entities are kept, changed ones re-processed, and anything
    /// no longer present in the source is removed at the end of the run.
    Sync {
        source: SourceKind,

        /// Stable sync identifier. Defaults to the source name.
        #[arg(long)]
        sync_id: Option<String>,

        /// Progress output on stderr. Defaults to `human` on a TTY.
        #[arg(long, value_enum)]
        progress: Option<ProgressMode>,
    },

    /// Show database statistics.
    Stats,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum SourceKind {
    Filesystem,
    Jsonl,
}

fn build_source(kind: SourceKind, cfg: &Config) -> Result<Box<dyn EntitySource>> {
    match kind {
        SourceKind::Filesystem => {
            let fs = cfg
                .sources
                .filesystem
                .clone()
                .ok_or_else(|| anyhow!("Filesystem source not configured ([sources.filesystem])"))?;
            Ok(Box::new(FilesystemSource::new(fs)))
        }
        SourceKind::Jsonl => {
            let jsonl = cfg
                .sources
                .jsonl
                .clone()
                .ok_or_else(|| anyhow!("JSON-lines source not configured ([sources.jsonl])"))?;
            Ok(Box::new(JsonlSource::new(jsonl)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync {
            source,
            sync_id,
            progress,
        } => {
            let source = build_source(source, &cfg)?;
            let reporter = progress.unwrap_or_else(ProgressMode::default_for_tty).reporter();

            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("interrupt received, cancelling sync");
                    trigger.cancel();
                }
            });

            let summary = ingest::run_sync(
                &cfg,
                source.as_ref(),
                sync_id.as_deref(),
                cancel,
                reporter.as_ref(),
            )
            .await?;

            println!("sync {}", source.name());
            println!("  sync id:   {}", summary.sync_id);
            println!("  job id:    {}", summary.sync_job_id);
            println!("  inserted:  {}", summary.counters.inserted);
            println!("  updated:   {}", summary.counters.updated);
            println!("  deleted:   {}", summary.counters.deleted);
            println!("  kept:      {}", summary.counters.kept);
            println!("  skipped:   {}", summary.counters.skipped);
            println!("  orphans:   {}", summary.orphans_removed);
            println!("ok");
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
