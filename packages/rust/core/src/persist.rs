//! Writing converted Markdown (and optionally its images) to the output folder.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use docflow_crawler::PageFetcher;
use docflow_markdown::{image_refs, rewrite_image_urls};
use docflow_shared::{DocflowError, Result, SourceType};
use serde::Serialize;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::convert::ConvertedDocument;

/// Characters kept in a preview.
pub const PREVIEW_CHARS: usize = 500;

/// Where a document ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedDocument {
    pub output_path: PathBuf,
    pub output_directory: PathBuf,
    pub content_length: usize,
    pub images_saved: usize,
}

/// Result of [`Persister::persist`]; I/O problems are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PersistOutcome {
    Saved(SavedDocument),
    Failed { error: String },
}

impl PersistOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Saved(_))
    }

    pub fn saved(&self) -> Option<&SavedDocument> {
        match self {
            Self::Saved(saved) => Some(saved),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Saved(_) => None,
            Self::Failed { error } => Some(error),
        }
    }

    /// Back to a `Result` for callers inside the batch core.
    pub fn into_result(self) -> Result<SavedDocument> {
        match self {
            Self::Saved(saved) => Ok(saved),
            Self::Failed { error } => Err(DocflowError::Processing(error)),
        }
    }
}

/// Saves converted documents under one output folder.
///
/// - inline images: `<out>/<base>.md`
/// - `save_images_as_files`: `<out>/<base>/<base>.md` plus `<out>/<base>/images/`
///
/// Clones share one table of claimed base names, so two sources that map
/// to the same name within a batch get `<base>`, `<base>_2`, ...
#[derive(Debug, Clone)]
pub struct Persister {
    output_dir: PathBuf,
    save_images_as_files: bool,
    fetcher: Option<PageFetcher>,
    /// Base name -> source that claimed it.
    claimed: Arc<Mutex<HashMap<String, String>>>,
}

impl Persister {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            save_images_as_files: false,
            fetcher: None,
            claimed: Arc::default(),
        }
    }

    /// Download remote images next to the Markdown using `fetcher`.
    pub fn with_image_files(mut self, fetcher: PageFetcher) -> Self {
        self.save_images_as_files = true;
        self.fetcher = Some(fetcher);
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write `doc`, naming it `basename` or a name derived from its source.
    #[instrument(skip_all, fields(source = %doc.source))]
    pub async fn persist(&self, doc: &ConvertedDocument, basename: Option<&str>) -> PersistOutcome {
        let base = match basename {
            Some(name) if !name.trim().is_empty() => sanitize_base_name(name),
            _ => base_name(&doc.source, doc.source_type),
        };
        let base = self.claim(&base, &doc.source);

        match self.write(doc, &base).await {
            Ok(saved) => {
                debug!(path = %saved.output_path.display(), "markdown saved");
                PersistOutcome::Saved(saved)
            }
            Err(e) => {
                warn!(error = %e, "failed to save markdown");
                PersistOutcome::Failed {
                    error: format!("failed to save markdown output: {e}"),
                }
            }
        }
    }

    /// First free name among `base`, `base_2`, `base_3`, ... A source that
    /// already holds a name (a retried document) gets the same one back.
    fn claim(&self, base: &str, source: &str) -> String {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        let mut n = 1;
        loop {
            let candidate = if n == 1 { base.to_string() } else { format!("{base}_{n}") };
            match claimed.get(&candidate) {
                Some(owner) if owner != source => n += 1,
                Some(_) => return candidate,
                None => {
                    claimed.insert(candidate.clone(), source.to_string());
                    return candidate;
                }
            }
        }
    }

    async fn write(&self, doc: &ConvertedDocument, base: &str) -> Result<SavedDocument> {
        let output_directory = if self.save_images_as_files {
            self.output_dir.join(base)
        } else {
            self.output_dir.clone()
        };
        tokio::fs::create_dir_all(&output_directory)
            .await
            .map_err(|e| DocflowError::io(&output_directory, e))?;

        let (markdown, images_saved) = match &self.fetcher {
            Some(fetcher) if self.save_images_as_files => {
                save_images(fetcher, &doc.markdown, &output_directory.join("images")).await
            }
            _ => (doc.markdown.clone(), 0),
        };

        let output_path = output_directory.join(format!("{base}.md"));
        tokio::fs::write(&output_path, &markdown)
            .await
            .map_err(|e| DocflowError::io(&output_path, e))?;

        Ok(SavedDocument {
            output_path,
            output_directory,
            content_length: markdown.chars().count(),
            images_saved,
        })
    }
}

/// Download each distinct remote image into `images_dir` and point the
/// Markdown at the local copy. Images that fail to download stay remote.
async fn save_images(fetcher: &PageFetcher, markdown: &str, images_dir: &Path) -> (String, usize) {
    let mut replacements: HashMap<String, String> = HashMap::new();

    for image in image_refs(markdown).into_iter().filter(|i| i.is_remote()) {
        if replacements.contains_key(&image.url) {
            continue;
        }
        match download_image(fetcher, &image.url, images_dir).await {
            Ok(file_name) => {
                replacements.insert(image.url, format!("images/{file_name}"));
            }
            Err(e) => warn!(url = %image.url, error = %e, "image download failed, keeping remote link"),
        }
    }

    let count = replacements.len();
    (rewrite_image_urls(markdown, &replacements), count)
}

async fn download_image(fetcher: &PageFetcher, url: &str, images_dir: &Path) -> Result<String> {
    let page = fetcher.fetch(url).await?;
    let ext = image_extension(&page.url, page.content_type.as_deref());
    let file_name = format!("{}.{ext}", &page.content_hash[..16.min(page.content_hash.len())]);

    tokio::fs::create_dir_all(images_dir)
        .await
        .map_err(|e| DocflowError::io(images_dir, e))?;
    let path = images_dir.join(&file_name);
    tokio::fs::write(&path, &page.body)
        .await
        .map_err(|e| DocflowError::io(&path, e))?;
    Ok(file_name)
}

fn image_extension(url: &Url, content_type: Option<&str>) -> String {
    const KNOWN: [&str; 7] = ["png", "jpg", "jpeg", "gif", "webp", "svg", "bmp"];

    let from_path = Path::new(url.path())
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| KNOWN.contains(&e.as_str()));
    let from_type = content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|mime| mime.trim().strip_prefix("image/"))
        .map(|sub| sub.trim_end_matches("+xml").to_ascii_lowercase())
        .filter(|e| KNOWN.contains(&e.as_str()));

    from_path
        .or(from_type)
        .unwrap_or_else(|| "png".to_string())
}

/// Output base name derived from a source.
///
/// File stem for files; for URLs the last path segment without extension,
/// else the host without `www.`; otherwise `document_<YYYYmmdd_HHMMSS>`.
pub fn base_name(source: &str, source_type: SourceType) -> String {
    let derived = match source_type {
        SourceType::File => Path::new(source)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string()),
        SourceType::Url => Url::parse(source).ok().and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
                .map(|segment| match segment.rsplit_once('.') {
                    Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                    _ => segment,
                })
                .or_else(|| {
                    url.host_str()
                        .map(|h| h.strip_prefix("www.").unwrap_or(h).to_string())
                })
        }),
        SourceType::Base64 => None,
    };

    match derived.filter(|d| !d.is_empty()) {
        Some(name) => sanitize_base_name(&name),
        None => format!("document_{}", Local::now().format("%Y%m%d_%H%M%S")),
    }
}

/// Replace every character outside `[A-Za-z0-9_-]` with `_`.
pub fn sanitize_base_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// First [`PREVIEW_CHARS`] characters, with `...` when truncated.
pub fn preview(markdown: &str) -> String {
    match markdown.char_indices().nth(PREVIEW_CHARS) {
        Some((cut, _)) => format!("{}...", &markdown[..cut]),
        None => markdown.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DocumentFormat;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn doc(source: &str, source_type: SourceType, markdown: &str) -> ConvertedDocument {
        ConvertedDocument {
            source: source.into(),
            source_type,
            format: DocumentFormat::Markdown,
            title: "T".into(),
            markdown: markdown.into(),
            word_count: 1,
            images_annotated: 0,
        }
    }

    #[test]
    fn base_names() {
        assert_eq!(base_name("/data/in/Annual Report.pdf", SourceType::File), "Annual_Report");
        assert_eq!(base_name("https://docs.example.com/guide/setup.html", SourceType::Url), "setup");
        assert_eq!(base_name("https://docs.example.com/guide/", SourceType::Url), "guide");
        assert_eq!(base_name("https://www.example.com/", SourceType::Url), "example_com");
        assert!(base_name("aGVsbG8=", SourceType::Base64).starts_with("document_"));
        assert_eq!(sanitize_base_name("my doc (v2)"), "my_doc__v2_");
    }

    #[test]
    fn preview_truncates_on_chars() {
        let short = "abc";
        assert_eq!(preview(short), "abc");
        let long = "é".repeat(PREVIEW_CHARS + 10);
        let p = preview(&long);
        assert!(p.ends_with("..."));
        assert_eq!(p.chars().count(), PREVIEW_CHARS + 3);
        assert_eq!(preview(&"x".repeat(PREVIEW_CHARS)), "x".repeat(PREVIEW_CHARS));
    }

    #[tokio::test]
    async fn inline_layout() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path());
        let outcome = persister
            .persist(&doc("/in/notes.md", SourceType::File, "# Notes\n"), None)
            .await;

        let saved = outcome.saved().unwrap();
        assert_eq!(saved.output_path, dir.path().join("notes.md"));
        assert_eq!(std::fs::read_to_string(&saved.output_path).unwrap(), "# Notes\n");
        assert_eq!(saved.content_length, 8);

        let renamed = persister
            .persist(&doc("/in/notes.md", SourceType::File, "x"), Some("custom name"))
            .await;
        assert_eq!(renamed.saved().unwrap().output_path, dir.path().join("custom_name.md"));
    }

    #[tokio::test]
    async fn same_stem_from_different_sources_gets_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let persister = Persister::new(dir.path());
        let shared = persister.clone();

        let guide = persister
            .persist(&doc("/in/guide/index.md", SourceType::File, "guide"), None)
            .await;
        let api = shared
            .persist(&doc("/in/api/index.md", SourceType::File, "api"), None)
            .await;
        let guide_again = persister
            .persist(&doc("/in/guide/index.md", SourceType::File, "guide v2"), None)
            .await;

        let guide_path = &guide.saved().unwrap().output_path;
        let api_path = &api.saved().unwrap().output_path;
        assert_eq!(guide_path, &dir.path().join("index.md"));
        assert_eq!(api_path, &dir.path().join("index_2.md"));
        assert_eq!(guide_again.saved().unwrap().output_path, *guide_path);
        assert_eq!(std::fs::read_to_string(guide_path).unwrap(), "guide v2");
        assert_eq!(std::fs::read_to_string(api_path).unwrap(), "api");
    }

    #[tokio::test]
    async fn image_files_layout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/img/chart.png"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(vec![0x89, b'P', b'N', b'G'], "image/png"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let fetcher = PageFetcher::new().unwrap().allow_localhost();
        let persister = Persister::new(dir.path()).with_image_files(fetcher);
        let md = format!(
            "# Report\n\n![Chart]({0}/img/chart.png)\n\n![Gone]({0}/img/missing.png)\n",
            server.uri()
        );

        let saved = persister
            .persist(&doc("/in/report.pdf", SourceType::File, &md), None)
            .await
            .into_result()
            .unwrap();

        assert_eq!(saved.output_directory, dir.path().join("report"));
        assert_eq!(saved.output_path, dir.path().join("report").join("report.md"));
        assert_eq!(saved.images_saved, 1);

        let written = std::fs::read_to_string(&saved.output_path).unwrap();
        assert!(written.contains("![Chart](images/"));
        assert!(written.contains(&format!("![Gone]({}/img/missing.png)", server.uri())));

        let images: Vec<_> = std::fs::read_dir(dir.path().join("report").join("images"))
            .unwrap()
            .collect();
        assert_eq!(images.len(), 1);
    }

    #[tokio::test]
    async fn write_failures_are_values() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a dir").unwrap();

        let outcome = Persister::new(&blocker)
            .persist(&doc("/in/a.md", SourceType::File, "a"), None)
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.error().unwrap().contains("failed to save"));
    }
}
