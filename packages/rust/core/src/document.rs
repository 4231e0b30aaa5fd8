//! Single-document processing: convert one source, then persist it.
//!
//! Both steps return tagged outcomes instead of errors. The batch adapter
//! ([`DocumentService`] as a [`DocumentProcessor`]) turns a failed outcome
//! into a failed result for that one document.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use docflow_batch::DocumentProcessor;
use docflow_shared::{DocflowError, DocumentInput, Result, SourceKind, SourceType, is_http_url};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::annotate::ImageAnnotator;
use crate::convert::{ConversionRequest, ConvertedDocument, DocumentConverter};
use crate::persist::{PersistOutcome, Persister};

/// Result of [`DocumentService::convert`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted(ConvertedDocument),
    Failed { error: String },
}

impl ConversionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Converted(_))
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Converted(_) => None,
            Self::Failed { error } => Some(error),
        }
    }

    pub fn into_result(self) -> Result<ConvertedDocument> {
        match self {
            Self::Converted(doc) => Ok(doc),
            Self::Failed { error } => Err(DocflowError::Processing(error)),
        }
    }
}

/// Converter, optional image annotator and persister for one output folder.
#[derive(Clone)]
pub struct DocumentService {
    converter: Arc<dyn DocumentConverter>,
    annotator: Option<ImageAnnotator>,
    persister: Persister,
}

impl DocumentService {
    pub fn new(converter: Arc<dyn DocumentConverter>, persister: Persister) -> Self {
        Self {
            converter,
            annotator: None,
            persister,
        }
    }

    /// Describe images in every converted document.
    pub fn with_annotator(mut self, annotator: ImageAnnotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn persister(&self) -> &Persister {
        &self.persister
    }

    /// Convert `source`, resolving `auto` first. Never returns an error.
    #[instrument(skip_all, fields(source = %truncate(source)))]
    pub async fn convert(&self, source: &str, kind: SourceKind) -> ConversionOutcome {
        let source_type = kind.resolve(source);
        match self.try_convert(source, source_type).await {
            Ok(doc) => {
                debug!(format = doc.format.as_str(), words = doc.word_count, "document converted");
                ConversionOutcome::Converted(doc)
            }
            Err(e) => {
                warn!(error = %e, "conversion failed");
                ConversionOutcome::Failed { error: e.to_string() }
            }
        }
    }

    async fn try_convert(&self, source: &str, source_type: SourceType) -> Result<ConvertedDocument> {
        match source_type {
            SourceType::File if !Path::new(source).exists() => {
                return Err(DocflowError::validation(format!("file not found: {source}")));
            }
            SourceType::Url if !is_http_url(source) => {
                return Err(DocflowError::validation(format!(
                    "URL must start with http:// or https://: {source}"
                )));
            }
            _ => {}
        }

        let request = ConversionRequest::new(source, source_type);
        let mut doc = self.converter.convert(&request).await?;

        if let Some(annotator) = &self.annotator {
            let (markdown, count) = annotator.annotate(&doc.markdown).await;
            doc.markdown = markdown;
            doc.images_annotated = count;
        }
        Ok(doc)
    }

    /// Write a converted document under the output folder.
    pub async fn persist(&self, doc: &ConvertedDocument, basename: Option<&str>) -> PersistOutcome {
        self.persister.persist(doc, basename).await
    }
}

/// JSON payload stored in a successful [`docflow_batch::ProcessingResult`].
pub(crate) fn document_payload(doc: &ConvertedDocument, outcome: &PersistOutcome) -> Value {
    let saved = outcome.saved();
    json!({
        "title": doc.title,
        "format": doc.format,
        "input_type": doc.source_type,
        "word_count": doc.word_count,
        "images_annotated": doc.images_annotated,
        "content_length": saved.map_or(doc.content_length(), |s| s.content_length),
        "output_path": saved.map(|s| s.output_path.display().to_string()),
        "images_saved": saved.map_or(0, |s| s.images_saved),
    })
}

#[async_trait]
impl DocumentProcessor<DocumentInput> for DocumentService {
    async fn process(&self, document: &DocumentInput) -> Result<Value> {
        let doc = self
            .convert(document.source(), document.source_type().into())
            .await
            .into_result()?;
        let outcome = self.persist(&doc, None).await;
        if let Some(error) = outcome.error() {
            return Err(DocflowError::Processing(error.to_string()));
        }
        Ok(document_payload(&doc, &outcome))
    }
}

/// Base64 payloads can be huge; keep log fields short.
fn truncate(source: &str) -> &str {
    match source.char_indices().nth(120) {
        Some((idx, _)) => &source[..idx],
        None => source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convert::DocumentFormat;

    struct StubConverter;

    #[async_trait]
    impl DocumentConverter for StubConverter {
        async fn convert(&self, request: &ConversionRequest) -> Result<ConvertedDocument> {
            if request.source.contains("broken") {
                return Err(DocflowError::Conversion("corrupt input".into()));
            }
            Ok(ConvertedDocument {
                source: request.source.clone(),
                source_type: request.source_type,
                format: DocumentFormat::Markdown,
                title: "Stub".into(),
                markdown: "# Stub\n\nBody\n".into(),
                word_count: 2,
                images_annotated: 0,
            })
        }
    }

    fn service(out: &Path) -> DocumentService {
        DocumentService::new(Arc::new(StubConverter), Persister::new(out))
    }

    #[tokio::test]
    async fn missing_file_is_a_failed_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = service(dir.path())
            .convert("/definitely/not/here.pdf", SourceKind::File)
            .await;
        assert!(!outcome.is_success());
        assert!(outcome.error().unwrap().contains("file not found"));
    }

    #[tokio::test]
    async fn url_kind_requires_http_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = service(dir.path()).convert("ftp://x/a.pdf", SourceKind::Url).await;
        assert!(outcome.error().unwrap().contains("http://"));
    }

    #[tokio::test]
    async fn converter_errors_are_captured() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = service(dir.path())
            .convert("https://example.com/broken", SourceKind::Auto)
            .await;
        assert_eq!(
            outcome,
            ConversionOutcome::Failed {
                error: "conversion error: corrupt input".into()
            }
        );
    }

    #[tokio::test]
    async fn auto_resolves_existing_path_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "# Notes").unwrap();

        let outcome = service(dir.path())
            .convert(path.to_str().unwrap(), SourceKind::Auto)
            .await;
        let doc = outcome.into_result().unwrap();
        assert_eq!(doc.source_type, SourceType::File);
    }

    #[tokio::test]
    async fn processor_converts_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let input = DocumentInput::url("https://example.com/guide/setup.html");

        let payload = svc.process(&input).await.unwrap();
        assert_eq!(payload["title"], "Stub");
        assert_eq!(payload["input_type"], "url");
        let path = payload["output_path"].as_str().unwrap();
        assert!(path.ends_with("setup.md"));
        assert!(Path::new(path).exists());

        let err = svc
            .process(&DocumentInput::url("https://example.com/broken"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("corrupt input"));
    }
}
