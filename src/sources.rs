//! Entity sources for the CLI.
//!
//! A source turns some external system into a list of [`Entity`] values.
//! Two are built in:
//!
//! - [`FilesystemSource`] walks a directory (`walkdir` + `globset` filters)
//!   and emits one `File` or `CodeFile` entity per matching file, keyed by
//!   its path relative to the root.
//! - [`JsonlSource`] reads one serialized [`Entity`] per line, which is
//!   also how explicit deletion signals (`"deleted": true`) are fed in.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

use crate::config::{FilesystemSourceConfig, JsonlSourceConfig};
pub use crate::extract::code_language;
use crate::models::{Breadcrumb, Entity};

#[async_trait]
pub trait EntitySource: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self) -> Result<Vec<Entity>>;
}

// ============ Filesystem ============

pub struct FilesystemSource {
    config: FilesystemSourceConfig,
}

impl FilesystemSource {
    pub fn new(config: FilesystemSourceConfig) -> Self {
        Self { config }
    }

    fn scan_blocking(config: &FilesystemSourceConfig) -> Result<Vec<Entity>> {
        let root = &config.root;
        if !root.exists() {
            bail!("Filesystem source root does not exist: {}", root.display());
        }

        let include_set = build_globset(&config.include_globs)?;
        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());
        let exclude_set = build_globset(&excludes)?;

        let mut entities = Vec::new();
        for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy().replace('\\', "/");

            if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
                continue;
            }

            entities.push(file_entity(path, &rel_str)?);
        }

        entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        Ok(entities)
    }
}

#[async_trait]
impl EntitySource for FilesystemSource {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn scan(&self) -> Result<Vec<Entity>> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || Self::scan_blocking(&config))
            .await
            .context("Filesystem scan task failed")?
    }
}

fn file_entity(path: &Path, relative_path: &str) -> Result<Entity> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("Failed to stat {}", path.display()))?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let absolute = path.to_path_buf();

    let mut entity = match code_language(path) {
        Some(language) => Entity::new(relative_path, "CodeFile").with_code(absolute.clone(), language),
        None => Entity::new(relative_path, "File").with_file(absolute.clone(), None),
    };
    entity = entity
        .with_name(name)
        .with_url(format!("file://{}", absolute.display()))
        .with_embeddable("path", relative_path)
        .with_field("size", metadata.len());
    if let Some(parent) = Path::new(relative_path).parent().filter(|p| !p.as_os_str().is_empty()) {
        let dir = parent.to_string_lossy().to_string();
        entity = entity.with_breadcrumb(Breadcrumb {
            name: dir.clone(),
            entity_id: dir,
            entity_type: "Directory".to_string(),
        });
    }
    if let crate::models::EntityContent::File(file) = &mut entity.content {
        file.size = Some(metadata.len());
    }
    Ok(entity)
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("Invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

// ============ JSON lines ============

pub struct JsonlSource {
    path: PathBuf,
}

impl JsonlSource {
    pub fn new(config: JsonlSourceConfig) -> Self {
        Self { path: config.path }
    }
}

#[async_trait]
impl EntitySource for JsonlSource {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn scan(&self) -> Result<Vec<Entity>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<Entity>(line)
                    .with_context(|| format!("{}:{}: invalid entity", self.path.display(), i + 1))
            })
            .collect()
    }
}
