//! TOML configuration for the sync pipeline.
//!
//! Every section except `[db]` is optional; missing fields fall back to the
//! defaults below. [`load_config`] parses and validates the file.
//!
//! ```toml
//! [db]
//! path = "./data/esync.sqlite"
//!
//! [sync]
//! batch_size = 100
//! hash_concurrency = 10
//!
//! [embedding]
//! provider = "hash"
//! dims = 256
//!
//! [destinations]
//! vector = "sqlite"
//! archive_dir = "./data/archive"
//!
//! [sources.filesystem]
//! root = "./docs"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub destinations: DestinationsConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Entities per ingestion slice.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Concurrent file reads while hashing.
    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,
    /// Files per converter call.
    #[serde(default = "default_converter_batch_size")]
    pub converter_batch_size: usize,
    /// Keys per metadata lookup round trip.
    #[serde(default = "default_lookup_chunk_size")]
    pub lookup_chunk_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            hash_concurrency: default_hash_concurrency(),
            converter_batch_size: default_converter_batch_size(),
            lookup_chunk_size: default_lookup_chunk_size(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}
fn default_hash_concurrency() -> usize {
    10
}
fn default_converter_batch_size() -> usize {
    crate::text::DEFAULT_CONVERTER_BATCH_SIZE
}
fn default_lookup_chunk_size() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_destination_base_secs")]
    pub destination_base_secs: u64,
    #[serde(default = "default_destination_max_attempts")]
    pub destination_max_attempts: u32,
    #[serde(default = "default_destination_max_delay_secs")]
    pub destination_max_delay_secs: u64,
    #[serde(default = "default_deadlock_base_ms")]
    pub deadlock_base_ms: u64,
    #[serde(default = "default_deadlock_max_attempts")]
    pub deadlock_max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            destination_base_secs: default_destination_base_secs(),
            destination_max_attempts: default_destination_max_attempts(),
            destination_max_delay_secs: default_destination_max_delay_secs(),
            deadlock_base_ms: default_deadlock_base_ms(),
            deadlock_max_attempts: default_deadlock_max_attempts(),
        }
    }
}

impl RetryConfig {
    pub fn destination_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_secs(self.destination_base_secs),
            max_attempts: self.destination_max_attempts,
            max_delay: Duration::from_secs(self.destination_max_delay_secs),
        }
    }

    pub fn deadlock_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.deadlock_base_ms),
            max_attempts: self.deadlock_max_attempts,
            max_delay: Duration::from_secs(5),
        }
    }
}

fn default_destination_base_secs() -> u64 {
    2
}
fn default_destination_max_attempts() -> u32 {
    4
}
fn default_destination_max_delay_secs() -> u64 {
    60
}
fn default_deadlock_base_ms() -> u64 {
    100
}
fn default_deadlock_max_attempts() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
        }
    }
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Compute sparse vectors when a destination supports keyword indexing.
    #[serde(default = "default_sparse")]
    pub sparse: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: default_dims(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            sparse: default_sparse(),
        }
    }
}

fn default_provider() -> String {
    "hash".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_sparse() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct DestinationsConfig {
    /// `sqlite`, `memory`, or `none`.
    #[serde(default = "default_vector_destination")]
    pub vector: String,
    /// Root directory of the raw-data archive. Disabled when unset.
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

impl Default for DestinationsConfig {
    fn default() -> Self {
        Self {
            vector: default_vector_destination(),
            archive_dir: None,
        }
    }
}

fn default_vector_destination() -> String {
    "sqlite".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    pub filesystem: Option<FilesystemSourceConfig>,
    pub jsonl: Option<JsonlSourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FilesystemSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct JsonlSourceConfig {
    pub path: PathBuf,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let sync = &config.sync;
    for (name, value) in [
        ("sync.batch_size", sync.batch_size),
        ("sync.hash_concurrency", sync.hash_concurrency),
        ("sync.converter_batch_size", sync.converter_batch_size),
        ("sync.lookup_chunk_size", sync.lookup_chunk_size),
        ("chunking.max_tokens", config.chunking.max_tokens),
    ] {
        if value == 0 {
            bail!("{} must be > 0", name);
        }
    }

    if config.retry.destination_max_attempts == 0 || config.retry.deadlock_max_attempts == 0 {
        bail!("retry attempts must be >= 1");
    }

    if config.embedding.dims == 0 {
        bail!("embedding.dims must be > 0");
    }

    match config.embedding.provider.as_str() {
        "hash" => {}
        "openai" => {
            if config.embedding.model.is_none() {
                bail!("embedding.model must be specified when provider is 'openai'");
            }
        }
        other => bail!(
            "Unknown embedding provider: '{}'. Must be hash or openai.",
            other
        ),
    }

    match config.destinations.vector.as_str() {
        "sqlite" | "memory" | "none" => {}
        other => bail!(
            "Unknown vector destination: '{}'. Must be sqlite, memory, or none.",
            other
        ),
    }

    Ok(())
}
