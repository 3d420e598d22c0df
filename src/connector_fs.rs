//! Filesystem connector.
//!
//! Harvests a local directory tree through the same engine as the remote
//! connectors. Each top-level subdirectory of `root` is a container; files
//! directly under `root` form a container labelled with the root's own
//! name. Items are files matching `include_globs` and not `exclude_globs`,
//! and their modification time drives incremental sync.
//!
//! A container is walked once per pass: the first page (`start == 0`)
//! scans and sorts it, later pages read from that snapshot, so offsets
//! stay stable even if files change mid-pass.
//!
//! `.html`/`.htm` files go through markup normalization; everything else
//! is read as plain text.
//!
//! # Configuration
//!
//! ```json
//! { "root": "/srv/docs", "include_globs": ["**/*.md"], "exclude_globs": ["drafts/**"] }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::discovery::ConnectorCatalog;
use crate::error::HarvestError;
use crate::harvest::{Container, Harvester, ItemRef, RemoteSource};
use crate::models::{ConfigField, Document, DocumentType, FieldType};
use crate::normalize::{clean_text, normalize_markup};
use crate::traits::{parse_config, Connector, ConnectorContext, ConnectorKind};

pub const TYPE_NAME: &str = "filesystem";

pub fn register(catalog: &mut ConnectorCatalog) {
    catalog.register::<FilesystemKind>(TYPE_NAME);
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

fn default_include_globs() -> Vec<String> {
    vec![
        "**/*.md".to_string(),
        "**/*.txt".to_string(),
        "**/*.html".to_string(),
    ]
}

/// [`RemoteSource`] over a local directory.
#[derive(Clone)]
pub struct FilesystemSource {
    root: PathBuf,
    root_label: String,
    include: GlobSet,
    exclude: GlobSet,
    follow_symlinks: bool,
    scans: Arc<Mutex<HashMap<String, Arc<Vec<ItemRef>>>>>,
}

impl FilesystemSource {
    pub fn new(config: &FilesystemConfig) -> Result<Self> {
        let include = build_globset(&config.include_globs)?;

        let mut default_excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        default_excludes.extend(config.exclude_globs.clone());
        let exclude = build_globset(&default_excludes)?;

        let root_label = config
            .root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| config.root.display().to_string());

        Ok(Self {
            root: config.root.clone(),
            root_label,
            include,
            exclude,
            follow_symlinks: config.follow_symlinks,
            scans: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn check_root(&self) -> Result<()> {
        if !self.root.is_dir() {
            bail!(
                "Filesystem connector root does not exist: {}",
                self.root.display()
            );
        }
        Ok(())
    }

    fn scan_containers(&self) -> Result<Vec<Container>> {
        self.check_root()?;
        let mut containers = vec![Container {
            key: String::new(),
            label: self.root_label.clone(),
        }];

        let mut dirs = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                if !self.exclude.is_match(format!("{}/", name)) && !self.exclude.is_match(&name) {
                    dirs.push(name);
                }
            }
        }
        dirs.sort();
        containers.extend(dirs.into_iter().map(|name| Container {
            key: name.clone(),
            label: name,
        }));
        Ok(containers)
    }

    /// Every matching file of `container`, sorted by relative path.
    fn scan_files(&self, container: &Container) -> Result<Vec<ItemRef>> {
        let (dir, max_depth) = if container.key.is_empty() {
            (self.root.clone(), 1)
        } else {
            (self.root.join(&container.key), usize::MAX)
        };

        let mut items = Vec::new();
        let walker = WalkDir::new(&dir)
            .follow_links(self.follow_symlinks)
            .max_depth(max_depth);
        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = relative_id(&self.root, entry.path());
            if self.exclude.is_match(&rel) || !self.include.is_match(&rel) {
                continue;
            }

            let modified = entry
                .metadata()?
                .modified()
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            items.push(ItemRef {
                id: rel,
                container_label: container.label.clone(),
                last_modified: DateTime::<Utc>::from(modified),
            });
        }

        // Sort for deterministic ordering
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    fn cached_scan(&self, key: &str) -> Option<Arc<Vec<ItemRef>>> {
        self.scans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// The sorted files of `container` for the current pass. Offset 0
    /// starts a new listing and always rescans.
    async fn snapshot(&self, container: &Container, start: usize) -> Result<Arc<Vec<ItemRef>>> {
        if start > 0 {
            if let Some(files) = self.cached_scan(&container.key) {
                return Ok(files);
            }
        }

        let source = self.clone();
        let scanned = container.clone();
        let files = tokio::task::spawn_blocking(move || source.scan_files(&scanned)).await??;
        let files = Arc::new(files);
        self.scans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(container.key.clone(), files.clone());
        Ok(files)
    }
}

fn relative_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

fn is_markup(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.ends_with(".html") || lower.ends_with(".htm")
}

#[async_trait]
impl RemoteSource for FilesystemSource {
    async fn list_containers(&self) -> Result<Vec<Container>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.scan_containers()).await?
    }

    async fn list_items(
        &self,
        container: &Container,
        start: usize,
        limit: usize,
    ) -> Result<Vec<ItemRef>> {
        let files = self.snapshot(container, start).await?;
        Ok(files.iter().skip(start).take(limit).cloned().collect())
    }

    async fn fetch_document(&self, item: &ItemRef, data_source_id: i64) -> Result<Document> {
        let path = self.root.join(&item.id);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;

        let content = if is_markup(&item.id) {
            normalize_markup(&raw)
        } else {
            clean_text(&raw)
        };

        let title = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Document {
            title,
            content,
            author: None,
            author_image_url: None,
            timestamp: item.last_modified,
            source_id: item.id.clone(),
            data_source_id,
            location: item.container_label.clone(),
            url: format!("file://{}", path.display()),
            doc_type: DocumentType::Document,
        })
    }
}

#[derive(Default)]
pub struct FilesystemKind;

#[async_trait]
impl ConnectorKind for FilesystemKind {
    fn display_name(&self) -> &str {
        "Local Directory"
    }

    fn config_fields(&self) -> Vec<ConfigField> {
        vec![
            ConfigField::required("root", "Root directory", FieldType::Path),
            ConfigField::optional("include_globs", "Include globs", FieldType::Text)
                .with_help("Defaults to **/*.md, **/*.txt, **/*.html"),
            ConfigField::optional("exclude_globs", "Exclude globs", FieldType::Text),
        ]
    }

    async fn validate_config(&self, config: &Value) -> crate::error::Result<()> {
        let parsed: FilesystemConfig = parse_config(TYPE_NAME, config)?;
        let source = FilesystemSource::new(&parsed)
            .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        source
            .list_containers()
            .await
            .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        Ok(())
    }

    fn build(&self, ctx: ConnectorContext) -> crate::error::Result<Box<dyn Connector>> {
        let parsed: FilesystemConfig = parse_config(TYPE_NAME, &ctx.config)?;
        let source = FilesystemSource::new(&parsed)
            .map_err(|e| HarvestError::config_invalid(TYPE_NAME, e))?;
        Ok(Box::new(Harvester::new(source, &ctx)))
    }
}
