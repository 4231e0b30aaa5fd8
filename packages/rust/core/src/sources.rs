//! Input source providers: turn a folder, a URL list or a sitemap into
//! [`DocumentInput`]s for the batch core.
//!
//! Enumeration happens once per provider. The first successful
//! [`InputSource::get_documents`] call is cached, so later calls return the
//! same list even if the folder or sitemap changed in between.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use docflow_discovery::UrlDiscoverer;
use docflow_shared::config::default_file_patterns;
use docflow_shared::{DocflowError, DocumentInput, Metadata, Result, SourceType};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::{Value, json};
use tokio::sync::OnceCell;
use tracing::{debug, instrument, warn};
use url::Url;
use walkdir::WalkDir;

/// Document count reported for a sitemap before it has been read.
pub const SITEMAP_ESTIMATE: usize = 50;

/// A provider of documents for one batch.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Enumerate the documents (cached after the first successful call).
    async fn get_documents(&self) -> Result<Vec<DocumentInput>>;

    /// Short provider kind: `folder`, `urls` or `sitemap`.
    fn source_type(&self) -> &'static str;

    /// Best-effort count; exact once enumerated.
    fn source_count(&self) -> usize;

    /// JSON description for reports.
    fn info(&self) -> Value;
}

// ---------------------------------------------------------------------------
// Folder
// ---------------------------------------------------------------------------

/// Files under a local folder matching glob patterns.
///
/// Patterns are matched against paths relative to the folder with `/` as a
/// literal separator: `*.md` only matches top-level files, `**/*.md` recurses.
pub struct FolderSource {
    folder: PathBuf,
    patterns: Vec<String>,
    globs: GlobSet,
    cache: OnceCell<Vec<DocumentInput>>,
}

impl FolderSource {
    /// Build a folder source. An empty pattern list means the default patterns.
    pub fn new(folder: impl Into<PathBuf>, patterns: &[String]) -> Result<Self> {
        let patterns = if patterns.is_empty() {
            default_file_patterns()
        } else {
            patterns.to_vec()
        };
        let globs = build_globset(&patterns)?;
        Ok(Self {
            folder: folder.into(),
            patterns,
            globs,
            cache: OnceCell::new(),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    fn check_folder(&self) -> Result<()> {
        if !self.folder.exists() {
            return Err(DocflowError::config(format!(
                "folder not found: {}",
                self.folder.display()
            )));
        }
        if !self.folder.is_dir() {
            return Err(DocflowError::config(format!(
                "path is not a directory: {}",
                self.folder.display()
            )));
        }
        Ok(())
    }

    /// Matching files, sorted by relative path.
    fn matching_files(&self) -> Vec<(PathBuf, String)> {
        let mut files: Vec<(PathBuf, String)> = WalkDir::new(&self.folder)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                let relative = entry
                    .path()
                    .strip_prefix(&self.folder)
                    .ok()?
                    .to_string_lossy()
                    .replace('\\', "/");
                self.globs
                    .is_match(&relative)
                    .then(|| (entry.into_path(), relative))
            })
            .collect();
        files.sort_by(|a, b| a.1.cmp(&b.1));
        files
    }

    fn enumerate(&self) -> Result<Vec<DocumentInput>> {
        self.check_folder()?;
        self.matching_files()
            .into_iter()
            .map(|(path, _)| file_document(&path))
            .collect()
    }
}

#[async_trait]
impl InputSource for FolderSource {
    #[instrument(skip_all, fields(folder = %self.folder.display()))]
    async fn get_documents(&self) -> Result<Vec<DocumentInput>> {
        let docs = self
            .cache
            .get_or_try_init(|| async { self.enumerate() })
            .await?;
        debug!(count = docs.len(), "folder enumerated");
        Ok(docs.clone())
    }

    fn source_type(&self) -> &'static str {
        "folder"
    }

    fn source_count(&self) -> usize {
        match self.cache.get() {
            Some(docs) => docs.len(),
            None if self.folder.is_dir() => self.matching_files().len(),
            None => 0,
        }
    }

    fn info(&self) -> Value {
        json!({
            "type": self.source_type(),
            "folder_path": self.folder.display().to_string(),
            "file_patterns": self.patterns,
            "exists": self.folder.exists(),
            "is_directory": self.folder.is_dir(),
            "estimated_document_count": self.source_count(),
        })
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| DocflowError::config(format!("invalid file pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| DocflowError::config(format!("invalid file patterns: {e}")))
}

fn file_document(path: &Path) -> Result<DocumentInput> {
    let meta = std::fs::metadata(path).map_err(|e| DocflowError::io(path, e))?;
    let modified: Option<DateTime<Utc>> = meta.modified().ok().map(DateTime::from);

    let mut metadata = Metadata::new();
    metadata.insert(
        "filename".into(),
        json!(path.file_name().map(|n| n.to_string_lossy().to_string())),
    );
    metadata.insert(
        "file_extension".into(),
        json!(
            path.extension()
                .map(|e| format!(".{}", e.to_string_lossy()))
                .unwrap_or_default()
        ),
    );
    metadata.insert("file_size".into(), json!(meta.len()));
    metadata.insert(
        "modified_time".into(),
        json!(modified.map(|m| m.to_rfc3339())),
    );

    Ok(DocumentInput::new(
        path.to_string_lossy().to_string(),
        SourceType::File,
        metadata,
    ))
}

// ---------------------------------------------------------------------------
// URL list
// ---------------------------------------------------------------------------

/// An explicit list of URLs, one document each.
pub struct UrlListSource {
    urls: Vec<String>,
    cache: OnceCell<Vec<DocumentInput>>,
}

impl UrlListSource {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            urls,
            cache: OnceCell::new(),
        }
    }
}

#[async_trait]
impl InputSource for UrlListSource {
    async fn get_documents(&self) -> Result<Vec<DocumentInput>> {
        let docs = self
            .cache
            .get_or_init(|| async { self.urls.iter().map(|u| url_document(u, None)).collect() })
            .await;
        Ok(docs.clone())
    }

    fn source_type(&self) -> &'static str {
        "urls"
    }

    fn source_count(&self) -> usize {
        self.urls.len()
    }

    fn info(&self) -> Value {
        json!({
            "type": self.source_type(),
            "urls": self.urls,
            "estimated_document_count": self.source_count(),
        })
    }
}

fn url_document(url: &str, sitemap_url: Option<&str>) -> DocumentInput {
    let mut metadata = Metadata::new();
    metadata.insert("url".into(), json!(url));
    if let Ok(parsed) = Url::parse(url) {
        metadata.insert("domain".into(), json!(parsed.host_str().unwrap_or_default()));
        metadata.insert("scheme".into(), json!(parsed.scheme()));
    }
    if let Some(sitemap_url) = sitemap_url {
        metadata.insert("source".into(), json!("sitemap"));
        metadata.insert("sitemap_url".into(), json!(sitemap_url));
    }
    DocumentInput::new(url, SourceType::Url, metadata)
}

// ---------------------------------------------------------------------------
// Sitemap
// ---------------------------------------------------------------------------

/// Pages listed by a sitemap (or found through the discoverer's fallbacks).
pub struct SitemapSource {
    sitemap_url: String,
    discoverer: Arc<dyn UrlDiscoverer>,
    max_urls: Option<usize>,
    cache: OnceCell<Vec<DocumentInput>>,
}

impl SitemapSource {
    pub fn new(sitemap_url: impl Into<String>, discoverer: Arc<dyn UrlDiscoverer>) -> Self {
        Self {
            sitemap_url: sitemap_url.into(),
            discoverer,
            max_urls: None,
            cache: OnceCell::new(),
        }
    }

    /// Keep at most `max_urls` discovered pages.
    pub fn with_max_urls(mut self, max_urls: usize) -> Self {
        self.max_urls = Some(max_urls);
        self
    }

    pub fn sitemap_url(&self) -> &str {
        &self.sitemap_url
    }

    async fn discover(&self) -> Vec<DocumentInput> {
        let urls = match self.discoverer.discover(&self.sitemap_url).await {
            Ok(urls) => urls,
            Err(e) => {
                warn!(sitemap = %self.sitemap_url, error = %e, "sitemap discovery failed");
                Vec::new()
            }
        };
        let limit = self.max_urls.unwrap_or(usize::MAX);
        urls.iter()
            .take(limit)
            .map(|u| url_document(u, Some(&self.sitemap_url)))
            .collect()
    }
}

#[async_trait]
impl InputSource for SitemapSource {
    #[instrument(skip_all, fields(sitemap = %self.sitemap_url))]
    async fn get_documents(&self) -> Result<Vec<DocumentInput>> {
        let docs = self.cache.get_or_init(|| self.discover()).await;
        debug!(count = docs.len(), "sitemap enumerated");
        Ok(docs.clone())
    }

    fn source_type(&self) -> &'static str {
        "sitemap"
    }

    fn source_count(&self) -> usize {
        self.cache.get().map_or(SITEMAP_ESTIMATE, Vec::len)
    }

    fn info(&self) -> Value {
        json!({
            "type": self.source_type(),
            "sitemap_url": self.sitemap_url,
            "max_urls": self.max_urls,
            "estimated_document_count": self.source_count(),
        })
    }
}
