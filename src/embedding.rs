//! Embedding providers and the chunk [`Embedder`].
//!
//! Providers:
//! - **[`HashEmbedder`]** — deterministic feature-hashing vectors, offline. Default.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API with retry and backoff.
//! - **[`TermFrequencySparse`]** — hashed term-frequency sparse vectors for
//!   keyword indexing.
//!
//! # Retry Strategy
//!
//! The OpenAI provider uses exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! # Parity
//!
//! [`Embedder::embed`] requires exactly one non-empty dense vector per chunk.
//! Anything else fails the batch: a chunk without a vector can never be
//! written to a vector destination.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::config::EmbeddingConfig;
use crate::error::{EmbeddingError, SyncError};
use crate::models::{Entity, SparseVector};

/// Sparse index space for hashed terms.
const SPARSE_BUCKETS: u64 = 1 << 20;

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
    /// One vector per input text, in input order.
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

#[async_trait]
pub trait SparseEmbeddingProvider: Send + Sync {
    async fn embed_sparse(&self, texts: &[String]) -> Result<Vec<SparseVector>, EmbeddingError>;
}

// ============ Hash embedder ============

/// Bag-of-words feature hashing into `dims` buckets, L2-normalized.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims: dims.max(1) }
    }

    fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vec = vec![0.0f32; self.dims];
        for token in tokens(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dims as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            vec[bucket] += sign;
        }
        let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            vec.iter_mut().for_each(|v| *v /= norm);
        }
        vec
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "feature-hash"
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

// ============ Sparse ============

/// Term counts over hashed token ids. Indices are sorted and unique.
pub struct TermFrequencySparse;

impl TermFrequencySparse {
    fn embed_one(text: &str) -> SparseVector {
        let mut counts: BTreeMap<u32, f32> = BTreeMap::new();
        for token in tokens(text) {
            let index = (fnv1a(token.as_bytes()) % SPARSE_BUCKETS) as u32;
            *counts.entry(index).or_default() += 1.0;
        }
        let (indices, values) = counts.into_iter().unzip();
        SparseVector { indices, values }
    }
}

#[async_trait]
impl SparseEmbeddingProvider for TermFrequencySparse {
    async fn embed_sparse(&self, texts: &[String]) -> Result<Vec<SparseVector>, EmbeddingError> {
        Ok(texts.iter().map(|t| Self::embed_one(t)).collect())
    }
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

/// 64-bit FNV-1a. Stable across platforms and releases.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

// ============ OpenAI ============

/// Embedding provider using the OpenAI API.
///
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dims: usize,
    max_retries: u32,
}

impl OpenAIProvider {
    /// # Errors
    ///
    /// Returns an error if `model` is not set in config, if
    /// `OPENAI_API_KEY` is not in the environment, or if the HTTP client
    /// cannot be built.
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model,
            dims: config.dims,
            max_retries: config.max_retries,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_many(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let mut last_err = None;
        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post("https://api.openai.com/v1/embeddings")
                .bearer_auth(&self.api_key)
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response
                            .json()
                            .await
                            .map_err(|e| EmbeddingError::Provider(e.to_string()))?;
                        return parse_openai_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    let err = EmbeddingError::Provider(format!(
                        "OpenAI API error {status}: {body_text}"
                    ));
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(attempt, %status, "embedding request failed, retrying");
                        last_err = Some(err);
                        continue;
                    }
                    return Err(err);
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "embedding request failed, retrying");
                    last_err = Some(EmbeddingError::Provider(e.to_string()));
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EmbeddingError::Provider("embedding failed after retries".into())))
    }
}

/// Extract `data[].embedding` arrays ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, EmbeddingError> {
    let invalid = |what: &str| EmbeddingError::Provider(format!("invalid OpenAI response: {what}"));
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| invalid("missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| invalid("missing embedding"))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map_or(position, |i| i as usize);
        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        indexed.push((index, vec));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Create the configured dense provider.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hash"` | [`HashEmbedder`] |
/// | `"openai"` | [`OpenAIProvider`] |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hash" => Ok(Arc::new(HashEmbedder::new(config.dims))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

/// The sparse provider, when sparse vectors are enabled.
pub fn create_sparse_provider(config: &EmbeddingConfig) -> Option<Arc<dyn SparseEmbeddingProvider>> {
    config
        .sparse
        .then(|| Arc::new(TermFrequencySparse) as Arc<dyn SparseEmbeddingProvider>)
}

// ============ Embedder ============

/// Assigns dense (and optionally sparse) vectors to chunk entities.
pub struct Embedder {
    dense: Arc<dyn EmbeddingProvider>,
    sparse: Option<Arc<dyn SparseEmbeddingProvider>>,
}

impl Embedder {
    pub fn new(
        dense: Arc<dyn EmbeddingProvider>,
        sparse: Option<Arc<dyn SparseEmbeddingProvider>>,
    ) -> Self {
        Self { dense, sparse }
    }

    /// Embed every chunk with one dense provider call.
    ///
    /// Sparse vectors are computed only when `keyword_index` is set and a
    /// sparse provider is configured. Their input is the chunk entity's JSON
    /// with `system_metadata` removed.
    pub async fn embed(
        &self,
        mut chunks: Vec<Entity>,
        keyword_index: bool,
    ) -> Result<Vec<Entity>, SyncError> {
        if chunks.is_empty() {
            return Ok(chunks);
        }

        let mut texts = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            if chunk.hash().is_none() {
                return Err(SyncError::invariant(format!(
                    "chunk {} reached embedding without a hash",
                    chunk.entity_id
                )));
            }
            match chunk.textual_representation.as_deref() {
                Some(text) if !text.trim().is_empty() => texts.push(text.to_string()),
                _ => {
                    return Err(SyncError::invariant(format!(
                        "chunk {} reached embedding without text",
                        chunk.entity_id
                    )))
                }
            }
        }

        let dense = self.dense.embed_many(&texts).await?;
        if dense.len() != chunks.len() {
            return Err(EmbeddingError::CountMismatch {
                expected: chunks.len(),
                actual: dense.len(),
            }
            .into());
        }

        let sparse = match (&self.sparse, keyword_index) {
            (Some(provider), true) => {
                let inputs = chunks
                    .iter()
                    .map(sparse_input)
                    .collect::<Result<Vec<_>, _>>()?;
                let vectors = provider.embed_sparse(&inputs).await?;
                if vectors.len() != chunks.len() {
                    return Err(EmbeddingError::CountMismatch {
                        expected: chunks.len(),
                        actual: vectors.len(),
                    }
                    .into());
                }
                Some(vectors)
            }
            _ => None,
        };

        for (chunk, vector) in chunks.iter_mut().zip(dense) {
            if vector.is_empty() {
                return Err(EmbeddingError::MissingVector {
                    entity_id: chunk.entity_id.clone(),
                }
                .into());
            }
            chunk.system_metadata.vectors.dense = Some(vector);
        }
        if let Some(sparse) = sparse {
            for (chunk, vector) in chunks.iter_mut().zip(sparse) {
                chunk.system_metadata.vectors.sparse = Some(vector);
            }
        }

        tracing::debug!(
            chunks = chunks.len(),
            model = self.dense.model_name(),
            "embedded chunks"
        );
        Ok(chunks)
    }
}

/// JSON of the entity without pipeline bookkeeping.
fn sparse_input(entity: &Entity) -> Result<String, SyncError> {
    let mut value = serde_json::to_value(entity).map_err(|e| {
        SyncError::invariant(format!("entity {} is not serializable: {e}", entity.entity_id))
    })?;
    if let Some(map) = value.as_object_mut() {
        map.remove("system_metadata");
    }
    Ok(value.to_string())
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
