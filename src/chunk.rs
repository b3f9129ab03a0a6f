//! Chunking and entity multiplication.
//!
//! Entities are routed into two lanes by content type:
//!
//! ```text
//!             ┌──────────────────┐
//!  code  ───▶ │   CodeChunker    │──┐
//!             └──────────────────┘  │   ┌─────────────────┐
//!                                   ├──▶│ ChunkMultiplier │──▶ chunk entities
//!             ┌──────────────────┐  │   └─────────────────┘
//!  text  ───▶ │     Chunker      │──┘
//!             └──────────────────┘
//! ```
//!
//! Each chunker returns an ordered list of chunk texts per input. The
//! multiplier builds one chunk entity per non-empty chunk with id
//! `"{parent_id}__chunk_{index}"` and lineage back to the parent.
//!
//! The built-in [`ParagraphChunker`] splits on paragraph boundaries and the
//! built-in [`BlockCodeChunker`] splits source files on top-level blocks.
//! Both approximate tokens as 4 characters.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{ChunkerError, ProcessingError, SyncError};
use crate::models::{Entity, EntityContent, EntityVectors, SystemMetadata};

/// Approximate characters-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Languages the block chunker knows how to split.
const BLOCK_LANGUAGES: &[&str] = &[
    "rust",
    "python",
    "javascript",
    "typescript",
    "go",
    "java",
    "c",
    "cpp",
    "csharp",
    "ruby",
    "php",
    "kotlin",
    "swift",
    "scala",
    "lua",
    "bash",
];

/// Splits texts into ordered chunk texts. One output list per input text.
#[async_trait]
pub trait Chunker: Send + Sync {
    fn name(&self) -> &str;

    async fn chunk_batch(&self, texts: &[String]) -> Result<Vec<Vec<String>>, ChunkerError>;
}

/// A chunker for source code that only handles some languages.
pub trait CodeChunker: Chunker {
    fn supports_language(&self, language: &str) -> bool;
}

// ============ Paragraph chunker ============

/// General-text chunker splitting on `\n\n` boundaries.
pub struct ParagraphChunker {
    max_tokens: usize,
}

impl ParagraphChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

#[async_trait]
impl Chunker for ParagraphChunker {
    fn name(&self) -> &str {
        "paragraph"
    }

    async fn chunk_batch(&self, texts: &[String]) -> Result<Vec<Vec<String>>, ChunkerError> {
        Ok(texts
            .iter()
            .map(|t| chunk_text(t, self.max_tokens))
            .collect())
    }
}

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
///
/// # Guarantees
///
/// - At least one chunk is always returned (empty for empty input).
/// - Chunks are split on `\n\n` boundaries when possible.
/// - Oversized paragraphs are hard-split at space/newline boundaries.
pub fn chunk_text(text: &str, max_tokens: usize) -> Vec<String> {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).max(1);

    if text.trim().is_empty() {
        return vec![String::new()];
    }

    let mut chunks = Vec::new();
    let mut current_buf = String::new();

    for para in text.split("\n\n") {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len()
        };

        if would_be > max_chars && !current_buf.is_empty() {
            chunks.push(std::mem::take(&mut current_buf));
        }

        if trimmed.len() > max_chars {
            hard_split(trimmed, max_chars, &mut chunks);
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        chunks.push(current_buf);
    }

    if chunks.is_empty() {
        chunks.push(text.trim().to_string());
    }

    chunks
}

/// Split an oversized piece at the last newline or space before `max_chars`.
fn hard_split(text: &str, max_chars: usize, out: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        let limit = snap_to_char_boundary(remaining, remaining.len().min(max_chars));
        let split_at = if limit < remaining.len() {
            remaining[..limit]
                .rfind('\n')
                .or_else(|| remaining[..limit].rfind(' '))
                .map(|pos| pos + 1)
                .unwrap_or(limit)
        } else {
            limit
        };
        let split_at = if split_at == 0 {
            // Always make progress, even on a single wide char.
            remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len())
        } else {
            split_at
        };

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            out.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Snap a byte index back to the nearest valid UTF-8 char boundary.
fn snap_to_char_boundary(s: &str, index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    let mut i = index;
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

// ============ Block code chunker ============

/// Code chunker that cuts source files at top-level blocks.
///
/// A block starts at a non-indented line that follows a blank line. Blocks
/// are packed greedily up to `max_tokens`; a single oversized block is cut
/// on line boundaries.
pub struct BlockCodeChunker {
    max_tokens: usize,
}

impl BlockCodeChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }

    fn chunk_source(&self, source: &str) -> Vec<String> {
        let max_chars = (self.max_tokens * CHARS_PER_TOKEN).max(1);
        let blocks = split_blocks(source);

        let mut chunks = Vec::new();
        let mut current = String::new();
        for block in blocks {
            if !current.is_empty() && current.len() + 1 + block.len() > max_chars {
                chunks.push(std::mem::take(&mut current));
            }
            if block.len() > max_chars {
                if !current.is_empty() {
                    chunks.push(std::mem::take(&mut current));
                }
                chunks.extend(split_lines(&block, max_chars));
                continue;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&block);
        }
        if !current.trim().is_empty() {
            chunks.push(current);
        }
        if chunks.is_empty() {
            chunks.push(String::new());
        }
        chunks
    }
}

fn split_blocks(source: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut previous_blank = false;

    for line in source.lines() {
        let blank = line.trim().is_empty();
        let top_level = !blank && !line.starts_with(char::is_whitespace) && !is_closer(line);
        if top_level && previous_blank && !current.is_empty() {
            blocks.push(current.join("\n").trim_end().to_string());
            current.clear();
        }
        if !(blank && current.is_empty()) {
            current.push(line);
        }
        previous_blank = blank;
    }
    if !current.is_empty() {
        blocks.push(current.join("\n").trim_end().to_string());
    }
    blocks.retain(|b| !b.trim().is_empty());
    blocks
}

fn is_closer(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('}') || t.starts_with(')') || t.starts_with(']') || t == "end"
}

fn is_bare_closer(line: &str) -> bool {
    let t = line.trim();
    t == "end" || (!t.is_empty() && t.len() <= 3 && t.chars().all(|c| matches!(c, '}' | ')' | ']' | ';' | ',')))
}

fn split_lines(block: &str, max_chars: usize) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for line in block.lines() {
        // A lone closer is kept with the lines it closes.
        if !current.is_empty() && is_bare_closer(line) {
            current.push('\n');
            current.push_str(line);
            continue;
        }
        if !current.is_empty() && current.len() + 1 + line.len() > max_chars {
            out.push(std::mem::take(&mut current));
        }
        if line.len() > max_chars {
            hard_split(line, max_chars, &mut out);
            continue;
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.trim().is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl Chunker for BlockCodeChunker {
    fn name(&self) -> &str {
        "code-block"
    }

    async fn chunk_batch(&self, texts: &[String]) -> Result<Vec<Vec<String>>, ChunkerError> {
        Ok(texts.iter().map(|t| self.chunk_source(t)).collect())
    }
}

impl CodeChunker for BlockCodeChunker {
    fn supports_language(&self, language: &str) -> bool {
        let language = language.to_ascii_lowercase();
        BLOCK_LANGUAGES.contains(&language.as_str())
    }
}

// ============ Multiplier ============

/// Builds chunk entities from a parent, copying only what survives chunking.
pub struct ChunkEntityBuilder<'a> {
    parent: &'a Entity,
}

impl<'a> ChunkEntityBuilder<'a> {
    pub fn new(parent: &'a Entity) -> Self {
        Self { parent }
    }

    pub fn build(&self, index: usize, text: String) -> Entity {
        let parent = self.parent;
        let meta = &parent.system_metadata;
        Entity {
            entity_id: format!("{}__chunk_{}", parent.entity_id, index),
            entity_type: parent.entity_type.clone(),
            entity_definition_id: parent.definition_id().to_string(),
            name: parent.name.clone(),
            fields: parent.fields.clone(),
            embeddable_fields: parent.embeddable_fields.clone(),
            breadcrumbs: Vec::new(),
            url: parent.url.clone(),
            content: EntityContent::Record,
            deleted: false,
            textual_representation: Some(text),
            system_metadata: SystemMetadata {
                source_name: meta.source_name.clone(),
                sync_id: meta.sync_id.clone(),
                sync_job_id: meta.sync_job_id.clone(),
                hash: meta.hash.clone(),
                chunk_index: Some(index),
                original_entity_id: Some(parent.entity_id.clone()),
                vectors: EntityVectors::default(),
            },
        }
    }
}

/// Chunk entities plus the parents that were dropped.
#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub chunks: Vec<Entity>,
    pub skipped: Vec<ProcessingError>,
}

pub struct ChunkMultiplier {
    text_chunker: Arc<dyn Chunker>,
    code_chunker: Arc<dyn CodeChunker>,
}

impl ChunkMultiplier {
    pub fn new(text_chunker: Arc<dyn Chunker>, code_chunker: Arc<dyn CodeChunker>) -> Self {
        Self {
            text_chunker,
            code_chunker,
        }
    }

    /// Paragraph and block chunkers sized by `max_tokens`.
    pub fn with_defaults(max_tokens: usize) -> Self {
        Self::new(
            Arc::new(ParagraphChunker::new(max_tokens)),
            Arc::new(BlockCodeChunker::new(max_tokens)),
        )
    }

    /// Split every entity into chunk entities.
    ///
    /// Entities must already carry a textual representation. Parents with an
    /// unsupported code language, no chunks, or an empty first chunk are
    /// skipped.
    pub async fn chunk(&self, entities: &[Entity]) -> Result<ChunkOutcome, SyncError> {
        let mut outcome = ChunkOutcome::default();
        let mut code_lane = Vec::new();
        let mut text_lane = Vec::new();

        for entity in entities {
            match entity.code_language() {
                Some(language) if !self.code_chunker.supports_language(language) => {
                    outcome.skipped.push(ProcessingError::UnsupportedLanguage {
                        entity_id: entity.entity_id.clone(),
                        language: language.to_string(),
                    });
                }
                Some(_) => code_lane.push(entity),
                None => text_lane.push(entity),
            }
        }

        let code_chunks = run_lane(self.code_chunker.as_ref(), &code_lane).await?;
        let text_chunks = run_lane(self.text_chunker.as_ref(), &text_lane).await?;

        for (parent, chunk_texts) in code_lane
            .into_iter()
            .zip(code_chunks)
            .chain(text_lane.into_iter().zip(text_chunks))
        {
            let first_is_empty = chunk_texts.first().map_or(true, |t| t.trim().is_empty());
            if first_is_empty {
                outcome.skipped.push(ProcessingError::EmptyChunks {
                    entity_id: parent.entity_id.clone(),
                });
                continue;
            }

            let builder = ChunkEntityBuilder::new(parent);
            let non_empty = chunk_texts.into_iter().filter(|t| !t.trim().is_empty());
            outcome
                .chunks
                .extend(non_empty.enumerate().map(|(i, text)| builder.build(i, text)));
        }

        for skipped in &outcome.skipped {
            tracing::warn!(error = %skipped, "skipping entity: chunking");
        }
        ensure_lineage(&outcome.chunks)?;
        Ok(outcome)
    }
}

async fn run_lane<C: Chunker + ?Sized>(
    chunker: &C,
    entities: &[&Entity],
) -> Result<Vec<Vec<String>>, SyncError> {
    if entities.is_empty() {
        return Ok(Vec::new());
    }
    let texts: Vec<String> = entities
        .iter()
        .map(|e| e.textual_representation.clone().unwrap_or_default())
        .collect();
    let chunks = chunker.chunk_batch(&texts).await?;
    if chunks.len() != texts.len() {
        return Err(ChunkerError::CountMismatch {
            expected: texts.len(),
            actual: chunks.len(),
        }
        .into());
    }
    Ok(chunks)
}

/// Every chunk entity must carry `chunk_index` and `original_entity_id`.
pub fn ensure_lineage(chunks: &[Entity]) -> Result<(), SyncError> {
    for chunk in chunks {
        let meta = &chunk.system_metadata;
        if meta.chunk_index.is_none() || meta.original_entity_id.is_none() {
            return Err(SyncError::invariant(format!(
                "chunk entity {} is missing lineage",
                chunk.entity_id
            )));
        }
    }
    Ok(())
}
