//! Textual representation of entities.
//!
//! Record entities get a markdown header only. File entities get the header
//! plus a `## Content` section with the converted file text. Code entities
//! get their raw source and no header, so code chunking sees only code.
//!
//! ```text
//! # Doc
//!
//! **Source**: notion
//! **Type**: Doc
//! **Name**: Roadmap
//! **status**: draft
//!
//! ## Content
//!
//! ...extracted text...
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::error::{ProcessingError, SyncError};
use crate::extract::{ContentConverter, ConverterRegistry};
use crate::models::Entity;

pub const DEFAULT_CONVERTER_BATCH_SIZE: usize = 10;

/// Entities with text set, plus the ones that were dropped.
#[derive(Debug, Default)]
pub struct TextOutcome {
    pub built: Vec<Entity>,
    pub skipped: Vec<ProcessingError>,
}

pub struct TextBuilder {
    registry: Arc<ConverterRegistry>,
    batch_size: usize,
}

/// Pending conversion: entity slot and its file path.
struct Pending {
    slot: usize,
    path: PathBuf,
}

impl TextBuilder {
    pub fn new(registry: Arc<ConverterRegistry>, batch_size: usize) -> Self {
        Self {
            registry,
            batch_size: batch_size.max(1),
        }
    }

    /// Set `textual_representation` on every entity that can be rendered.
    ///
    /// Entities with a missing path, an extension without a converter, or a
    /// failed conversion are skipped. A converter returning `Err` fails the
    /// whole call with [`SyncError::Extraction`].
    pub async fn build(&self, entities: Vec<Entity>) -> Result<TextOutcome, SyncError> {
        let mut slots: Vec<Option<Entity>> = Vec::with_capacity(entities.len());
        let mut skipped = Vec::new();
        let mut groups: HashMap<String, (Arc<dyn ContentConverter>, Vec<Pending>)> =
            HashMap::new();

        for mut entity in entities {
            if !entity.has_file_content() {
                entity.textual_representation = Some(render_header(&entity));
                slots.push(Some(entity));
                continue;
            }

            let Some(path) = entity.local_path().map(PathBuf::from) else {
                skipped.push(ProcessingError::MissingLocalPath {
                    entity_id: entity.entity_id.clone(),
                });
                continue;
            };
            let extension = entity.file_extension().unwrap_or_default();
            let Some(converter) = self.registry.get(&extension) else {
                skipped.push(ProcessingError::UnsupportedFileType {
                    entity_id: entity.entity_id.clone(),
                    extension,
                });
                continue;
            };

            let slot = slots.len();
            slots.push(Some(entity));
            groups
                .entry(converter.name().to_string())
                .or_insert_with(|| (converter, Vec::new()))
                .1
                .push(Pending { slot, path });
        }

        for (name, (converter, pending)) in groups {
            for batch in pending.chunks(self.batch_size) {
                let paths: Vec<PathBuf> = batch.iter().map(|p| p.path.clone()).collect();
                let mut converted = converter
                    .convert_batch(&paths)
                    .await
                    .map_err(|e| SyncError::Extraction(format!("{name}: {e}")))?;

                for item in batch {
                    let Some(entity) = slots[item.slot].as_mut() else {
                        continue;
                    };
                    match converted.remove(&item.path) {
                        Some(text) => {
                            let rendered = if entity.is_code() {
                                text
                            } else {
                                format!("{}\n## Content\n\n{}", render_header(entity), text)
                            };
                            entity.textual_representation = Some(rendered);
                        }
                        None => {
                            skipped.push(ProcessingError::ConversionFailed {
                                entity_id: entity.entity_id.clone(),
                            });
                            slots[item.slot] = None;
                        }
                    }
                }
            }
        }

        for err in &skipped {
            tracing::warn!(error = %err, "skipping entity: text build");
        }
        Ok(TextOutcome {
            built: slots.into_iter().flatten().collect(),
            skipped,
        })
    }
}

/// The markdown metadata header for an entity.
pub fn render_header(entity: &Entity) -> String {
    let mut out = format!("# {}\n\n", entity.entity_type);
    if let Some(source) = &entity.system_metadata.source_name {
        out.push_str(&format!("**Source**: {source}\n"));
    }
    out.push_str(&format!("**Type**: {}\n", entity.entity_type));
    if !entity.name.is_empty() {
        out.push_str(&format!("**Name**: {}\n", entity.name));
    }
    for key in &entity.embeddable_fields {
        match entity.fields.get(key) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) => out.push_str(&format!("**{key}**: {s}\n")),
            Some(other) => out.push_str(&format!("**{key}**: {other}\n")),
        }
    }
    out
}
