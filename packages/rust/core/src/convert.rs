//! Single-document conversion: the [`DocumentConverter`] seam and the
//! built-in converter for files, URLs and base64 payloads.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use docflow_crawler::PageFetcher;
use docflow_markdown::{ConvertOptions, ConvertResult, TextFlavor, convert_html, convert_text};
use docflow_shared::{DocflowError, Result, SourceType};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::extract;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Formats the built-in converter understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentFormat {
    Pdf,
    Docx,
    Html,
    Markdown,
    Text,
}

impl DocumentFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pdf => "pdf",
            Self::Docx => "docx",
            Self::Html => "html",
            Self::Markdown => "markdown",
            Self::Text => "text",
        }
    }

    /// Format from a file extension (without the dot, any case).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            "html" | "htm" | "xhtml" => Some(Self::Html),
            "md" | "markdown" | "mdx" => Some(Self::Markdown),
            "txt" | "text" => Some(Self::Text),
            _ => None,
        }
    }

    /// Format from a MIME type (parameters ignored).
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();
        match mime.as_str() {
            "application/pdf" => Some(Self::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                Some(Self::Docx)
            }
            "text/html" | "application/xhtml+xml" => Some(Self::Html),
            "text/markdown" | "text/x-markdown" => Some(Self::Markdown),
            "text/plain" => Some(Self::Text),
            _ => None,
        }
    }

    /// Guess from leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.starts_with(b"%PDF") {
            return Some(Self::Pdf);
        }
        if bytes.starts_with(b"PK\x03\x04") {
            return Some(Self::Docx);
        }
        let text = std::str::from_utf8(bytes).ok()?;
        let head: String = text
            .trim_start_matches('\u{feff}')
            .trim_start()
            .chars()
            .take(512)
            .collect::<String>()
            .to_ascii_lowercase();
        if head.starts_with("<!doctype html") || head.starts_with("<html") || head.contains("<body") {
            Some(Self::Html)
        } else {
            Some(Self::Markdown)
        }
    }
}

/// What to convert. `source_type` is already resolved (never `auto`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub source: String,
    pub source_type: SourceType,
}

impl ConversionRequest {
    pub fn new(source: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            source: source.into(),
            source_type,
        }
    }
}

/// A successfully converted document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvertedDocument {
    pub source: String,
    pub source_type: SourceType,
    pub format: DocumentFormat,
    pub title: String,
    pub markdown: String,
    pub word_count: usize,
    /// Images that received a generated description.
    #[serde(default)]
    pub images_annotated: usize,
}

impl ConvertedDocument {
    pub fn content_length(&self) -> usize {
        self.markdown.chars().count()
    }
}

/// Collaborator that turns one source into Markdown.
#[async_trait]
pub trait DocumentConverter: Send + Sync {
    async fn convert(&self, request: &ConversionRequest) -> Result<ConvertedDocument>;
}

// ---------------------------------------------------------------------------
// Built-in converter
// ---------------------------------------------------------------------------

/// Converter backed by `pdf-extract`, the DOCX reader, `htmd` and the
/// Markdown cleanup passes. URLs go through the crawler's [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct BuiltinConverter {
    fetcher: PageFetcher,
    frontmatter: bool,
}

impl BuiltinConverter {
    pub fn new(fetch_timeout: Duration) -> Result<Self> {
        Ok(Self {
            fetcher: PageFetcher::with_timeout(fetch_timeout)?,
            frontmatter: true,
        })
    }

    /// Allow fetching from localhost/private IPs.
    pub fn allow_localhost(mut self) -> Self {
        self.fetcher = self.fetcher.allow_localhost();
        self
    }

    /// Prepend a YAML frontmatter block (on by default).
    pub fn with_frontmatter(mut self, frontmatter: bool) -> Self {
        self.frontmatter = frontmatter;
        self
    }

    fn options(&self, source: &str) -> ConvertOptions {
        ConvertOptions {
            source: source.to_string(),
            title: None,
            converted_at: Some(Utc::now().to_rfc3339()),
            frontmatter: self.frontmatter,
        }
    }

    async fn convert_file(&self, path: &str) -> Result<(DocumentFormat, ConvertResult)> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| DocflowError::io(path, e))?;
        let ext = Path::new(path)
            .extension()
            .map(|e| e.to_string_lossy().to_string());

        let format = match ext.as_deref().and_then(DocumentFormat::from_extension) {
            Some(format) => format,
            None => match DocumentFormat::sniff(&bytes) {
                // an unknown extension on a ZIP is .pptx/.xlsx/.odt territory
                Some(DocumentFormat::Docx) | None => return Err(unsupported(ext.as_deref())),
                Some(format) => format,
            },
        };

        let result = self.convert_bytes(bytes, format, &self.options(path)).await?;
        Ok((format, result))
    }

    async fn convert_url(&self, url: &str) -> Result<(DocumentFormat, ConvertResult)> {
        let page = self.fetcher.fetch(url).await?;
        let url_ext = Path::new(page.url.path())
            .extension()
            .map(|e| e.to_string_lossy().to_string());

        let format = page
            .content_type
            .as_deref()
            .and_then(DocumentFormat::from_content_type)
            .or_else(|| url_ext.as_deref().and_then(DocumentFormat::from_extension))
            .or_else(|| DocumentFormat::sniff(&page.body))
            .ok_or_else(|| {
                DocflowError::Conversion(format!(
                    "unsupported content type '{}'",
                    page.content_type.as_deref().unwrap_or("unknown")
                ))
            })?;
        debug!(url = %page.url, format = format.as_str(), "fetched document");

        let result = self
            .convert_bytes(page.body, format, &self.options(page.url.as_str()))
            .await?;
        Ok((format, result))
    }

    async fn convert_base64(&self, payload: &str) -> Result<(DocumentFormat, ConvertResult)> {
        let (declared, data) = split_data_uri(payload);
        let bytes = STANDARD
            .decode(data.trim())
            .unwrap_or_else(|_| payload.as_bytes().to_vec());

        let format = declared
            .and_then(DocumentFormat::from_content_type)
            .or_else(|| DocumentFormat::sniff(&bytes))
            .ok_or_else(|| DocflowError::Conversion("unrecognized binary content".into()))?;

        let result = self
            .convert_bytes(bytes, format, &self.options("base64"))
            .await?;
        Ok((format, result))
    }

    async fn convert_bytes(
        &self,
        bytes: Vec<u8>,
        format: DocumentFormat,
        opts: &ConvertOptions,
    ) -> Result<ConvertResult> {
        match format {
            DocumentFormat::Pdf => {
                let text = tokio::task::spawn_blocking(move || extract::pdf_text(&bytes))
                    .await
                    .map_err(|e| DocflowError::Conversion(format!("PDF extraction aborted: {e}")))??;
                convert_text(&text, TextFlavor::Plain, opts)
            }
            DocumentFormat::Docx => {
                let md = extract::docx_markdown(&bytes)?;
                convert_text(&md, TextFlavor::Markdown, opts)
            }
            DocumentFormat::Html => convert_html(&String::from_utf8_lossy(&bytes), opts),
            DocumentFormat::Markdown => {
                convert_text(&String::from_utf8_lossy(&bytes), TextFlavor::Markdown, opts)
            }
            DocumentFormat::Text => {
                convert_text(&String::from_utf8_lossy(&bytes), TextFlavor::Plain, opts)
            }
        }
    }
}

#[async_trait]
impl DocumentConverter for BuiltinConverter {
    #[instrument(skip_all, fields(source_type = request.source_type.as_str()))]
    async fn convert(&self, request: &ConversionRequest) -> Result<ConvertedDocument> {
        let (format, result) = match request.source_type {
            SourceType::File => self.convert_file(&request.source).await?,
            SourceType::Url => self.convert_url(&request.source).await?,
            SourceType::Base64 => self.convert_base64(&request.source).await?,
        };

        Ok(ConvertedDocument {
            source: request.source.clone(),
            source_type: request.source_type,
            format,
            title: result.title,
            markdown: result.markdown,
            word_count: result.word_count,
            images_annotated: 0,
        })
    }
}

fn unsupported(ext: Option<&str>) -> DocflowError {
    match ext {
        Some(ext) => DocflowError::Conversion(format!("unsupported document format '.{ext}'")),
        None => DocflowError::Conversion("unsupported document format".into()),
    }
}

/// `data:<mime>;base64,<payload>` → (`Some(mime)`, payload).
fn split_data_uri(payload: &str) -> (Option<&str>, &str) {
    payload
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .map(|(header, data)| (header.split(';').next(), data))
        .unwrap_or((None, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn converter() -> BuiltinConverter {
        BuiltinConverter::new(Duration::from_secs(5))
            .unwrap()
            .allow_localhost()
            .with_frontmatter(false)
    }

    #[test]
    fn format_detection() {
        assert_eq!(DocumentFormat::from_extension("PDF"), Some(DocumentFormat::Pdf));
        assert_eq!(DocumentFormat::from_extension("pptx"), None);
        assert_eq!(
            DocumentFormat::from_content_type("text/html; charset=utf-8"),
            Some(DocumentFormat::Html)
        );
        assert_eq!(DocumentFormat::sniff(b"%PDF-1.7"), Some(DocumentFormat::Pdf));
        assert_eq!(
            DocumentFormat::sniff(b"  <!DOCTYPE html><html></html>"),
            Some(DocumentFormat::Html)
        );
        assert_eq!(DocumentFormat::sniff(b"# Notes"), Some(DocumentFormat::Markdown));
        assert_eq!(DocumentFormat::sniff(&[0xff, 0xfe, 0x00]), None);
    }

    #[test]
    fn data_uri_split() {
        assert_eq!(
            split_data_uri("data:text/html;base64,PGgxPg=="),
            (Some("text/html"), "PGgxPg==")
        );
        assert_eq!(split_data_uri("PGgxPg=="), (None, "PGgxPg=="));
    }

    #[tokio::test]
    async fn converts_markdown_and_html_files() {
        let dir = tempfile::tempdir().unwrap();
        let md_path = dir.path().join("guide.md");
        std::fs::write(&md_path, "# Guide\n\n\n\nSteps here.\n").unwrap();
        let html_path = dir.path().join("page.html");
        std::fs::write(&html_path, "<html><head><title>Page</title></head><body><h1>Hello</h1><p>World</p></body></html>").unwrap();

        let conv = converter();
        let md = conv
            .convert(&ConversionRequest::new(md_path.to_string_lossy(), SourceType::File))
            .await
            .unwrap();
        assert_eq!(md.format, DocumentFormat::Markdown);
        assert_eq!(md.title, "Guide");
        assert_eq!(md.markdown, "# Guide\n\nSteps here.\n");

        let html = conv
            .convert(&ConversionRequest::new(html_path.to_string_lossy(), SourceType::File))
            .await
            .unwrap();
        assert_eq!(html.format, DocumentFormat::Html);
        assert!(html.markdown.contains("# Hello"));
    }

    #[tokio::test]
    async fn converts_docx_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memo.docx");
        let body = r#"<w:p><w:pPr><w:pStyle w:val="Title"/></w:pPr><w:r><w:t>Memo</w:t></w:r></w:p><w:p><w:r><w:t>Ship it.</w:t></w:r></w:p>"#;
        std::fs::write(&path, crate::extract::tests::docx_bytes(body)).unwrap();

        let doc = converter()
            .convert(&ConversionRequest::new(path.to_string_lossy(), SourceType::File))
            .await
            .unwrap();
        assert_eq!(doc.format, DocumentFormat::Docx);
        assert_eq!(doc.title, "Memo");
        assert!(doc.markdown.contains("Ship it."));
    }

    #[tokio::test]
    async fn unsupported_and_missing_files_fail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deck.pptx");
        std::fs::write(&path, b"PK\x03\x04rest").unwrap();

        let conv = converter();
        let err = conv
            .convert(&ConversionRequest::new(path.to_string_lossy(), SourceType::File))
            .await
            .unwrap_err();
        assert!(err.to_string().contains(".pptx"));

        let missing = dir.path().join("nope.md");
        assert!(
            conv.convert(&ConversionRequest::new(missing.to_string_lossy(), SourceType::File))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn converts_base64_payloads() {
        let conv = converter();
        let html = STANDARD.encode("<html><body><h1>Encoded</h1><p>Body text</p></body></html>");
        let doc = conv
            .convert(&ConversionRequest::new(html, SourceType::Base64))
            .await
            .unwrap();
        assert_eq!(doc.format, DocumentFormat::Html);
        assert_eq!(doc.title, "Encoded");

        let uri = format!("data:text/plain;base64,{}", STANDARD.encode("Just some text."));
        let doc = conv
            .convert(&ConversionRequest::new(uri, SourceType::Base64))
            .await
            .unwrap();
        assert_eq!(doc.format, DocumentFormat::Text);
        assert!(doc.markdown.contains("Just some text."));

        // not base64 at all: treated as raw Markdown
        let raw = conv
            .convert(&ConversionRequest::new("# Raw notes!", SourceType::Base64))
            .await
            .unwrap();
        assert_eq!(raw.title, "Raw notes!");
    }

    #[tokio::test]
    async fn converts_urls_by_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/docs/intro"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    "<html><body><main><h1>Intro</h1><p><a href=\"/docs/next\">Next</a></p></main></body></html>",
                    "text/html; charset=utf-8",
                ),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/notes.md"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_raw("# Notes\n\nplain", "application/octet-stream"),
            )
            .mount(&server)
            .await;

        let conv = converter();
        let doc = conv
            .convert(&ConversionRequest::new(
                format!("{}/docs/intro", server.uri()),
                SourceType::Url,
            ))
            .await
            .unwrap();
        assert_eq!(doc.format, DocumentFormat::Html);
        assert!(doc.markdown.contains(&format!("[Next]({}/docs/next)", server.uri())));

        let notes = conv
            .convert(&ConversionRequest::new(format!("{}/notes.md", server.uri()), SourceType::Url))
            .await
            .unwrap();
        assert_eq!(notes.format, DocumentFormat::Markdown);
    }

    #[tokio::test]
    async fn frontmatter_on_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let md_path = dir.path().join("a.md");
        std::fs::write(&md_path, "# A\n\nbody\n").unwrap();
        let doc = BuiltinConverter::new(Duration::from_secs(5))
            .unwrap()
            .convert(&ConversionRequest::new(md_path.to_string_lossy(), SourceType::File))
            .await
            .unwrap();
        assert!(doc.markdown.starts_with("---\n"));
    }
}
