//! Pipeline tools: list, folder, sitemap, mixed, single-document and ingest.
//!
//! Every tool validates its options up front, enumerates documents, runs
//! the batch core with retry rounds and returns a [`PipelineReport`].
//! Configuration problems produce a single failed report before any task
//! starts; per-document failures only show up in the report's summaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use docflow_batch::{
    BatchProcessor, BatchProgress, DocumentProcessor, OperationRegistry, ProcessingResult,
    RetryOutcome, RetryPolicy, SilentProgress, duration_secs, run_with_retries,
};
use docflow_crawler::PageFetcher;
use docflow_discovery::{DiscoveryOptions, SitemapDiscoverer, UrlDiscoverer};
use docflow_shared::{
    AppConfig, BatchConfig, BatchId, DocflowError, DocumentInput, Result, SourceKind,
    is_http_url, validate_range,
};
use docflow_storage::Storage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::annotate::ImageAnnotator;
use crate::convert::{BuiltinConverter, DocumentConverter};
use crate::document::{ConversionOutcome, DocumentService, document_payload};
use crate::embedding::Embedder;
use crate::ingest::{IngestProcessor, IngestRequest};
use crate::persist::{Persister, preview};
use crate::sources::{FolderSource, InputSource, SitemapSource, UrlListSource};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Outcome of one document in a pipeline run (its latest attempt).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSummary {
    pub source: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "duration_secs")]
    pub processing_time: Duration,
    pub attempts: u32,
    pub retried: bool,
}

impl DocumentSummary {
    fn from_result(result: &ProcessingResult, attempts: u32) -> Self {
        let payload = result.result();
        let field = |name: &str| payload.and_then(|p| p.get(name));
        let count = |name: &str| field(name).and_then(Value::as_u64).map(|n| n as usize);
        Self {
            source: result.source().to_string(),
            success: result.is_success(),
            input_type: field("input_type").and_then(Value::as_str).map(String::from),
            output_path: field("output_path").and_then(Value::as_str).map(String::from),
            content_length: count("content_length"),
            chunk_count: count("chunk_count"),
            token_count: count("token_count"),
            error: result.error().map(String::from),
            processing_time: result.processing_time(),
            attempts,
            retried: attempts > 1,
        }
    }
}

/// JSON-serializable result of a pipeline tool.
///
/// `success` means the tool ran: it is `false` only when the run was
/// rejected (bad options, missing API key) or found nothing to process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineReport {
    pub success: bool,
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub total_documents: usize,
    #[serde(default)]
    pub successful_documents: usize,
    #[serde(default)]
    pub failed_documents: usize,
    #[serde(default)]
    pub success_rate: f64,
    #[serde(default, with = "duration_secs")]
    pub total_processing_time: Duration,
    #[serde(default)]
    pub retry_rounds: usize,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_info: Option<Value>,
    #[serde(default)]
    pub results: Vec<DocumentSummary>,
    /// Tool-specific fields (preview, chunk totals, ...).
    #[serde(default, skip_serializing_if = "Map::is_empty", flatten)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl PipelineReport {
    /// A run rejected before any document was processed.
    pub fn failure(tool: &str, error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            tool: tool.to_string(),
            batch_id: None,
            total_documents: 0,
            successful_documents: 0,
            failed_documents: 0,
            success_rate: 0.0,
            total_processing_time: Duration::ZERO,
            retry_rounds: 0,
            options: Value::Null,
            source_info: None,
            results: Vec::new(),
            extra: Map::new(),
            error: Some(error.to_string()),
            message: String::new(),
            timestamp: Utc::now(),
        }
    }

    fn from_outcome(tool: &str, outcome: &RetryOutcome, options: Value) -> Self {
        let batch = outcome.final_result();
        let results = batch
            .results()
            .iter()
            .enumerate()
            .map(|(i, r)| DocumentSummary::from_result(r, outcome.attempts().get(i).copied().unwrap_or(1)))
            .collect();

        let mut message = format!(
            "Processed {}/{} documents successfully",
            batch.successful_documents(),
            batch.total_documents()
        );
        if !outcome.rounds().is_empty() {
            message.push_str(&format!(" after {} retry round(s)", outcome.rounds().len()));
        }

        Self {
            success: true,
            tool: tool.to_string(),
            batch_id: Some(batch.batch_id().to_string()),
            total_documents: batch.total_documents(),
            successful_documents: batch.successful_documents(),
            failed_documents: batch.failed_documents(),
            success_rate: batch.success_rate(),
            total_processing_time: batch.processing_time(),
            retry_rounds: outcome.rounds().len(),
            options,
            source_info: None,
            results,
            extra: Map::new(),
            error: None,
            message,
            timestamp: Utc::now(),
        }
    }

    fn with_source_info(mut self, info: Value) -> Self {
        self.source_info = Some(info);
        self
    }

    fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Inputs of the mixed-source tool. Every list may be empty, not all at once.
#[derive(Debug, Clone, Default)]
pub struct MixedSources {
    pub folders: Vec<PathBuf>,
    pub urls: Vec<String>,
    pub sitemaps: Vec<String>,
    /// Folder glob patterns; empty means the configured defaults.
    pub file_patterns: Vec<String>,
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Holds the collaborators shared by all tools.
pub struct Pipeline {
    config: AppConfig,
    registry: Arc<OperationRegistry>,
    progress: Arc<dyn BatchProgress>,
    converter: Arc<dyn DocumentConverter>,
    discoverer: Arc<dyn UrlDiscoverer>,
    image_fetcher: PageFetcher,
    annotator: Option<ImageAnnotator>,
}

impl Pipeline {
    /// Build the default HTTP-backed collaborators from `config`.
    pub fn new(config: AppConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.conversion.fetch_timeout_secs);
        let converter = BuiltinConverter::new(timeout)?;
        let discoverer = SitemapDiscoverer::new(DiscoveryOptions::from(&config.sitemap))?;
        Ok(Self {
            registry: Arc::new(OperationRegistry::default()),
            progress: Arc::new(SilentProgress),
            converter: Arc::new(converter),
            discoverer: Arc::new(discoverer),
            image_fetcher: PageFetcher::with_timeout(timeout)?,
            annotator: None,
            config,
        })
    }

    pub fn with_converter(mut self, converter: Arc<dyn DocumentConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn with_discoverer(mut self, discoverer: Arc<dyn UrlDiscoverer>) -> Self {
        self.discoverer = discoverer;
        self
    }

    /// Fetcher used to download images when saving them as files.
    pub fn with_image_fetcher(mut self, fetcher: PageFetcher) -> Self {
        self.image_fetcher = fetcher;
        self
    }

    /// Use `annotator` instead of building one from `[conversion]`.
    pub fn with_annotator(mut self, annotator: ImageAnnotator) -> Self {
        self.annotator = Some(annotator);
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn BatchProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Registry shared by every batch this pipeline runs.
    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Batch options from config (no CLI overrides).
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig::from(&self.config)
    }

    fn batch_processor(&self, opts: &BatchConfig) -> Result<BatchProcessor> {
        let batch = BatchProcessor::with_registry(opts.max_concurrent, Arc::clone(&self.registry))?
            .with_progress(Arc::clone(&self.progress));
        match opts.batch_size {
            Some(size) => batch.with_chunk_size(size),
            None => Ok(batch),
        }
    }

    fn document_service(&self, opts: &BatchConfig) -> Result<DocumentService> {
        let mut persister = Persister::new(&opts.output_dir);
        if opts.save_images_as_files {
            persister = persister.with_image_files(self.image_fetcher.clone());
        }
        let mut service = DocumentService::new(Arc::clone(&self.converter), persister);
        if opts.annotate_images {
            let annotator = match &self.annotator {
                Some(annotator) => annotator.clone(),
                None => ImageAnnotator::from_config(&self.config.conversion)?,
            };
            service = service.with_annotator(annotator);
        }
        Ok(service)
    }

    async fn run<P>(
        &self,
        tool: &str,
        documents: &[DocumentInput],
        processor: Arc<P>,
        opts: &BatchConfig,
    ) -> Result<PipelineReport>
    where
        P: DocumentProcessor<DocumentInput> + 'static,
    {
        let batch = self.batch_processor(opts)?;
        let started = Instant::now();
        let outcome = run_with_retries(
            &batch,
            documents,
            processor,
            Some(BatchId::new().to_string()),
            RetryPolicy::new(opts.retry_rounds()),
        )
        .await;

        let report = PipelineReport::from_outcome(tool, &outcome, options_json(opts));
        info!(
            tool,
            batch_id = outcome.batch_id(),
            total = report.total_documents,
            successful = report.successful_documents,
            failed = report.failed_documents,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "pipeline finished"
        );
        Ok(report)
    }

    async fn convert_batch(
        &self,
        tool: &str,
        documents: &[DocumentInput],
        opts: &BatchConfig,
    ) -> Result<PipelineReport> {
        let service = Arc::new(self.document_service(opts)?);
        self.run(tool, documents, service, opts).await
    }

    // -- tools --------------------------------------------------------------

    /// Convert a list of sources (paths, URLs or base64), type auto-detected.
    #[instrument(skip_all, fields(count = sources.len()))]
    pub async fn process_list(&self, sources: &[String], opts: &BatchConfig) -> PipelineReport {
        self.try_process_list(sources, opts)
            .await
            .unwrap_or_else(|e| rejected("process_list", e))
    }

    async fn try_process_list(&self, sources: &[String], opts: &BatchConfig) -> Result<PipelineReport> {
        if sources.is_empty() {
            return Err(DocflowError::validation("input_sources list must not be empty"));
        }
        validate_range("max_concurrent", opts.max_concurrent, 1, 20)?;
        if let Some(size) = opts.batch_size {
            validate_range("batch_size", size, 1, 100)?;
        }
        let documents: Vec<DocumentInput> =
            sources.iter().map(|s| DocumentInput::detect(s.as_str())).collect();
        self.convert_batch("process_list", &documents, opts).await
    }

    /// Convert every file under `folder` matching `patterns`.
    #[instrument(skip_all, fields(folder = %folder.display()))]
    pub async fn process_folder(
        &self,
        folder: &Path,
        patterns: &[String],
        opts: &BatchConfig,
    ) -> PipelineReport {
        self.try_process_folder(folder, patterns, opts)
            .await
            .unwrap_or_else(|e| rejected("process_folder", e))
    }

    async fn try_process_folder(
        &self,
        folder: &Path,
        patterns: &[String],
        opts: &BatchConfig,
    ) -> Result<PipelineReport> {
        const TOOL: &str = "process_folder";
        validate_range("max_concurrent", opts.max_concurrent, 1, 50)?;
        let source = FolderSource::new(folder, patterns)?;
        let documents = source.get_documents().await?;
        if documents.is_empty() {
            let error = format!(
                "No documents found in {} matching {:?}",
                source.folder().display(),
                source.patterns()
            );
            return Ok(PipelineReport::failure(TOOL, error).with_source_info(source.info()));
        }
        Ok(self
            .convert_batch(TOOL, &documents, opts)
            .await?
            .with_source_info(source.info()))
    }

    /// Convert up to `max_urls` pages listed by a sitemap.
    #[instrument(skip_all, fields(sitemap = %sitemap_url))]
    pub async fn process_sitemap(
        &self,
        sitemap_url: &str,
        max_urls: usize,
        opts: &BatchConfig,
    ) -> PipelineReport {
        self.try_process_sitemap(sitemap_url, max_urls, opts)
            .await
            .unwrap_or_else(|e| rejected("process_sitemap", e))
    }

    async fn try_process_sitemap(
        &self,
        sitemap_url: &str,
        max_urls: usize,
        opts: &BatchConfig,
    ) -> Result<PipelineReport> {
        const TOOL: &str = "process_sitemap";
        if !is_http_url(sitemap_url) {
            return Err(DocflowError::validation(format!(
                "sitemap URL must start with http:// or https://: {sitemap_url}"
            )));
        }
        validate_range("max_concurrent", opts.max_concurrent, 1, 20)?;
        validate_range("max_urls", max_urls, 1, 10_000)?;

        let source =
            SitemapSource::new(sitemap_url, Arc::clone(&self.discoverer)).with_max_urls(max_urls);
        let documents = source.get_documents().await?;
        if documents.is_empty() {
            let error = format!("No URLs discovered from sitemap {sitemap_url}");
            return Ok(PipelineReport::failure(TOOL, error).with_source_info(source.info()));
        }
        Ok(self
            .convert_batch(TOOL, &documents, opts)
            .await?
            .with_source_info(source.info()))
    }

    /// Convert folders, URLs and sitemaps in one batch. A source that fails
    /// to enumerate is recorded in `source_info` and skipped.
    #[instrument(skip_all, fields(
        folders = sources.folders.len(),
        urls = sources.urls.len(),
        sitemaps = sources.sitemaps.len()
    ))]
    pub async fn process_mixed(&self, sources: &MixedSources, opts: &BatchConfig) -> PipelineReport {
        self.try_process_mixed(sources, opts)
            .await
            .unwrap_or_else(|e| rejected("process_mixed", e))
    }

    async fn try_process_mixed(
        &self,
        sources: &MixedSources,
        opts: &BatchConfig,
    ) -> Result<PipelineReport> {
        const TOOL: &str = "process_mixed";
        if sources.folders.is_empty() && sources.urls.is_empty() && sources.sitemaps.is_empty() {
            return Err(DocflowError::validation(
                "at least one input source must be provided (folders, urls or sitemaps)",
            ));
        }
        validate_range("max_concurrent", opts.max_concurrent, 1, 50)?;

        let mut documents = Vec::new();
        let mut folders = Vec::new();
        for folder in &sources.folders {
            let listed = match FolderSource::new(folder, &sources.file_patterns) {
                Ok(source) => enumerate(&source).await,
                Err(e) => (json!({"type": "folder", "folder_path": folder}), Err(e)),
            };
            folders.push(record_source(listed, &mut documents));
        }

        let mut urls = Vec::new();
        if !sources.urls.is_empty() {
            let source = UrlListSource::new(sources.urls.clone());
            urls.push(record_source(enumerate(&source).await, &mut documents));
        }

        let mut sitemaps = Vec::new();
        for sitemap in &sources.sitemaps {
            let source = SitemapSource::new(sitemap.as_str(), Arc::clone(&self.discoverer))
                .with_max_urls(self.config.sitemap.max_urls);
            sitemaps.push(record_source(enumerate(&source).await, &mut documents));
        }

        let info = json!({"folders": folders, "urls": urls, "sitemaps": sitemaps});
        if documents.is_empty() {
            return Ok(
                PipelineReport::failure(TOOL, "No documents found in any of the provided sources")
                    .with_source_info(info),
            );
        }

        let report = self.convert_batch(TOOL, &documents, opts).await?;
        let message = format!(
            "Processed {}/{} documents from mixed sources successfully",
            report.successful_documents, report.total_documents
        );
        Ok(PipelineReport {
            message,
            ..report.with_source_info(info)
        })
    }

    /// Convert and save one document; the report carries a Markdown preview.
    #[instrument(skip_all)]
    pub async fn convert_single(
        &self,
        source: &str,
        kind: SourceKind,
        basename: Option<&str>,
        opts: &BatchConfig,
    ) -> PipelineReport {
        self.try_convert_single(source, kind, basename, opts)
            .await
            .unwrap_or_else(|e| rejected("convert_single", e))
    }

    async fn try_convert_single(
        &self,
        source: &str,
        kind: SourceKind,
        basename: Option<&str>,
        opts: &BatchConfig,
    ) -> Result<PipelineReport> {
        if source.trim().is_empty() {
            return Err(DocflowError::validation("input_source must be provided"));
        }
        let service = self.document_service(opts)?;

        let started = Instant::now();
        let batch_id = BatchId::new().to_string();
        let mut extra = Map::new();
        let result = match service.convert(source, kind).await {
            ConversionOutcome::Failed { error } => {
                ProcessingResult::failed(&batch_id, source, error, started.elapsed())
            }
            ConversionOutcome::Converted(doc) => {
                let outcome = service.persist(&doc, basename).await;
                extra.insert("title".into(), json!(doc.title));
                extra.insert("format".into(), json!(doc.format));
                extra.insert("word_count".into(), json!(doc.word_count));
                extra.insert("images_annotated".into(), json!(doc.images_annotated));
                extra.insert("preview".into(), json!(preview(&doc.markdown)));
                match outcome.error() {
                    Some(error) => {
                        ProcessingResult::failed(&batch_id, source, error, started.elapsed())
                    }
                    None => ProcessingResult::succeeded(
                        &batch_id,
                        source,
                        document_payload(&doc, &outcome),
                        started.elapsed(),
                    ),
                }
            }
        };

        let summary = DocumentSummary::from_result(&result, 1);
        let success = summary.success;
        let message = match &summary.output_path {
            Some(path) => format!("Converted {} to {path}", truncate(source)),
            None => format!("Failed to convert {}", truncate(source)),
        };
        info!(batch_id = %batch_id, success, elapsed_ms = started.elapsed().as_millis() as u64, "single conversion finished");

        Ok(PipelineReport {
            success,
            tool: "convert_single".to_string(),
            batch_id: Some(batch_id),
            total_documents: 1,
            successful_documents: usize::from(success),
            failed_documents: usize::from(!success),
            success_rate: if success { 1.0 } else { 0.0 },
            total_processing_time: started.elapsed(),
            retry_rounds: 0,
            options: options_json(opts),
            source_info: None,
            error: summary.error.clone(),
            results: vec![summary],
            extra,
            message,
            timestamp: Utc::now(),
        })
    }

    /// Convert, chunk, embed and store `request.url` (and, when following
    /// links, the pages discovered from it) into a vector collection.
    #[instrument(skip_all, fields(url = %request.url, collection = %request.collection))]
    pub async fn ingest(
        &self,
        request: &IngestRequest,
        opts: &BatchConfig,
        embedder: Arc<dyn Embedder>,
        storage: Arc<Storage>,
    ) -> PipelineReport {
        self.try_ingest(request, opts, embedder, storage)
            .await
            .unwrap_or_else(|e| rejected("ingest", e))
    }

    async fn try_ingest(
        &self,
        request: &IngestRequest,
        opts: &BatchConfig,
        embedder: Arc<dyn Embedder>,
        storage: Arc<Storage>,
    ) -> Result<PipelineReport> {
        if !is_http_url(&request.url) {
            return Err(DocflowError::validation(format!(
                "URL must start with http:// or https://: {}",
                request.url
            )));
        }
        if request.collection.trim().is_empty() {
            return Err(DocflowError::validation("collection name must not be empty"));
        }
        validate_range("max_concurrent", opts.max_concurrent, 1, 20)?;
        validate_range("max_urls", request.max_urls, 1, 10_000)?;
        let max_tokens = request
            .max_tokens
            .unwrap_or(self.config.embedding.chunk_max_tokens);
        validate_range("max_tokens", max_tokens, 1, 8192)?;

        let urls = if request.follow_links {
            self.discover_for_ingest(&request.url, request.max_urls).await
        } else {
            vec![request.url.clone()]
        };
        let documents: Vec<DocumentInput> = urls.into_iter().map(DocumentInput::url).collect();

        let processor = Arc::new(IngestProcessor {
            converter: Arc::clone(&self.converter),
            embedder: Arc::clone(&embedder),
            storage,
            write_lock: Mutex::new(()),
            collection: request.collection.clone(),
            max_tokens,
            embed_batch: self.config.embedding.batch_size,
            metadata: request.metadata.clone(),
        });
        let report = self.run("ingest", &documents, processor, opts).await?;

        let total_chunks: usize = report.results.iter().filter_map(|r| r.chunk_count).sum();
        let total_tokens: usize = report.results.iter().filter_map(|r| r.token_count).sum();
        Ok(report
            .with_extra("collection", request.collection.clone())
            .with_extra("total_chunks", total_chunks)
            .with_extra("total_tokens", total_tokens)
            .with_extra("embedding_model", embedder.model().to_string()))
    }

    async fn discover_for_ingest(&self, url: &str, max_urls: usize) -> Vec<String> {
        match self.discoverer.discover(url).await {
            Ok(urls) if !urls.is_empty() => urls.into_iter().take(max_urls).collect(),
            Ok(_) => vec![url.to_string()],
            Err(e) => {
                warn!(%url, error = %e, "discovery failed, indexing the entry page only");
                vec![url.to_string()]
            }
        }
    }
}

fn rejected(tool: &str, error: DocflowError) -> PipelineReport {
    warn!(tool, error = %error, "pipeline rejected");
    PipelineReport::failure(tool, error)
}

fn truncate(source: &str) -> &str {
    match source.char_indices().nth(80) {
        Some((idx, _)) => &source[..idx],
        None => source,
    }
}

fn options_json(opts: &BatchConfig) -> Value {
    json!({
        "max_concurrent": opts.max_concurrent,
        "batch_size": opts.batch_size,
        "retry_failed": opts.retry_failed,
        "max_retries": opts.max_retries,
        "output_dir": opts.output_dir,
        "annotate_images": opts.annotate_images,
        "save_images_as_files": opts.save_images_as_files,
    })
}

async fn enumerate<S: InputSource>(source: &S) -> (Value, Result<Vec<DocumentInput>>) {
    let documents = source.get_documents().await;
    (source.info(), documents)
}

fn record_source(
    (mut info, listed): (Value, Result<Vec<DocumentInput>>),
    documents: &mut Vec<DocumentInput>,
) -> Value {
    match listed {
        Ok(found) => {
            info["document_count"] = json!(found.len());
            documents.extend(found);
        }
        Err(e) => {
            warn!(error = %e, "input source failed, skipping");
            info["document_count"] = json!(0);
            info["error"] = json!(e.to_string());
        }
    }
    info
}
