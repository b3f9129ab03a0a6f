//! Error taxonomy for the sync pipeline.
//!
//! Errors fall into two tiers:
//!
//! | Type | Scope | Policy |
//! |------|-------|--------|
//! | [`ProcessingError`] | one entity | drop the entity, count it as skipped, continue |
//! | [`SyncError`] | batch / run | abort the sync job, never commit partially |
//!
//! Collaborator contracts have their own error types ([`DestinationError`],
//! [`MetadataError`], [`EmbeddingError`], [`ChunkerError`], [`ExtractError`])
//! which carry the retry classification the dispatcher needs and are
//! wrapped into [`SyncError`] once they become fatal.

use std::path::PathBuf;

use thiserror::Error;

/// A per-entity failure. The offending entity is removed from its batch.
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("entity {entity_id} has file content but no local path")]
    MissingLocalPath { entity_id: String },

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no converter registered for extension '{extension}' ({entity_id})")]
    UnsupportedFileType { entity_id: String, extension: String },

    #[error("no code chunker supports language '{language}' ({entity_id})")]
    UnsupportedLanguage { entity_id: String, language: String },

    #[error("content extraction failed for {entity_id}")]
    ConversionFailed { entity_id: String },

    #[error("entity {entity_id} produced no usable chunks")]
    EmptyChunks { entity_id: String },

    #[error("failed to serialize entity {entity_id}: {source}")]
    Serialize {
        entity_id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ProcessingError {
    /// Id of the entity this failure belongs to, when known.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            ProcessingError::MissingLocalPath { entity_id }
            | ProcessingError::UnsupportedFileType { entity_id, .. }
            | ProcessingError::UnsupportedLanguage { entity_id, .. }
            | ProcessingError::ConversionFailed { entity_id }
            | ProcessingError::EmptyChunks { entity_id }
            | ProcessingError::Serialize { entity_id, .. } => Some(entity_id),
            ProcessingError::FileRead { .. } => None,
        }
    }
}

/// A batch- or run-fatal failure.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A pipeline invariant was violated. Indicates a programming error.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("chunker failed: {0}")]
    Chunker(#[from] ChunkerError),

    #[error("content extraction failed: {0}")]
    Extraction(String),

    #[error("destination '{destination}' failed: {source}")]
    Destination {
        destination: String,
        #[source]
        source: DestinationError,
    },

    #[error("metadata store failed: {0}")]
    Metadata(#[from] MetadataError),

    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn invariant(msg: impl Into<String>) -> Self {
        SyncError::Invariant(msg.into())
    }

    pub fn destination(destination: &str, source: DestinationError) -> Self {
        match source {
            DestinationError::Cancelled => SyncError::Cancelled,
            source => SyncError::Destination {
                destination: destination.to_string(),
                source,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SyncError::Cancelled)
            || matches!(self, SyncError::Metadata(MetadataError::Cancelled))
    }
}

/// Failure reported by a destination adapter.
#[derive(Debug, Error)]
pub enum DestinationError {
    /// Connection refused, timeout, 5xx. Retried with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Authentication or validation failure (4xx). Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("cancelled")]
    Cancelled,
}

impl DestinationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DestinationError::Unavailable(_))
    }
}

/// Failure reported by the relational metadata store.
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Store-internal contention. Retried with the short deadlock backoff.
    #[error("transaction deadlock: {0}")]
    Deadlock(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error("{0}")]
    Other(String),

    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("expected {expected} vectors, provider returned {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("missing dense vector for {entity_id}")]
    MissingVector { entity_id: String },
}

#[derive(Debug, Error)]
pub enum ChunkerError {
    #[error("expected {expected} chunk lists, chunker returned {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("{0}")]
    Backend(String),
}

/// Failure of a content converter as a whole.
///
/// Per-file failures are expressed by leaving the file out of the
/// converter's result map; this error is reserved for infrastructure
/// failures that should fail the sync.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("PDF extraction failed: {0}")]
    Pdf(String),

    #[error("OOXML extraction failed: {0}")]
    Ooxml(String),

    #[error("converter infrastructure failure: {0}")]
    Infrastructure(String),
}
