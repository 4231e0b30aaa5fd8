//! Bounded-concurrency batch runner.
//!
//! A [`Semaphore`] sized `max_concurrent` is the admission gate. Every
//! document runs in its own spawned task; handles are awaited in input
//! order so results stay positional and no task is ever lost.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use docflow_shared::{BatchId, DocflowError, DocumentInput, Result};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tracing::{Instrument, debug, info, instrument, warn};
use uuid::Uuid;

use crate::progress::{BatchProgress, SilentProgress};
use crate::registry::{OperationRecord, OperationRegistry, OperationStatus};
use crate::result::{BatchResult, ProcessingResult};

// ---------------------------------------------------------------------------
// Seams
// ---------------------------------------------------------------------------

/// Human-readable label of a document, copied into its results.
pub trait SourceLabel {
    fn source_label(&self) -> String;
}

impl SourceLabel for DocumentInput {
    fn source_label(&self) -> String {
        self.source().to_string()
    }
}

impl SourceLabel for String {
    fn source_label(&self) -> String {
        self.clone()
    }
}

/// Per-document work run by the batch core. Called concurrently.
#[async_trait]
pub trait DocumentProcessor<D>: Send + Sync {
    async fn process(&self, document: &D) -> Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`DocumentProcessor`].
pub struct FnProcessor<F> {
    f: F,
}

/// Wrap `f` so it can be handed to [`BatchProcessor::process_documents`].
///
/// The closure receives an owned clone of each document.
pub fn processor_fn<D, F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(D) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value>> + Send,
{
    FnProcessor { f }
}

#[async_trait]
impl<D, F, Fut> DocumentProcessor<D> for FnProcessor<F>
where
    D: Clone + Send + Sync + 'static,
    F: Fn(D) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value>> + Send + 'static,
{
    async fn process(&self, document: &D) -> Result<serde_json::Value> {
        (self.f)(document.clone()).await
    }
}

// ---------------------------------------------------------------------------
// BatchProcessor
// ---------------------------------------------------------------------------

/// Snapshot of the processor's load and registry contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessingStats {
    pub max_concurrent: usize,
    pub active_operations: usize,
    pub completed_operations: usize,
    pub failed_operations: usize,
    pub processing_operations: usize,
    pub available_slots: usize,
}

/// Runs a processor over many documents with at most `max_concurrent`
/// in flight at any instant.
pub struct BatchProcessor {
    max_concurrent: usize,
    semaphore: Arc<Semaphore>,
    registry: Arc<OperationRegistry>,
    progress: Arc<dyn BatchProgress>,
    chunk_size: Option<usize>,
}

impl BatchProcessor {
    /// Create a processor with its own default-capacity registry.
    pub fn new(max_concurrent: usize) -> Result<Self> {
        Self::with_registry(max_concurrent, Arc::new(OperationRegistry::default()))
    }

    /// Create a processor that records operations in `registry`.
    pub fn with_registry(max_concurrent: usize, registry: Arc<OperationRegistry>) -> Result<Self> {
        if max_concurrent < 1 {
            return Err(DocflowError::config(format!(
                "max_concurrent must be at least 1 (got {max_concurrent})"
            )));
        }
        Ok(Self {
            max_concurrent,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            registry,
            progress: Arc::new(SilentProgress),
            chunk_size: None,
        })
    }

    /// Report per-document progress to `progress`.
    pub fn with_progress(mut self, progress: Arc<dyn BatchProgress>) -> Self {
        self.progress = progress;
        self
    }

    /// Run long lists as consecutive sub-batches of `chunk_size` documents.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Result<Self> {
        if chunk_size < 1 {
            return Err(DocflowError::config("batch_size must be at least 1"));
        }
        self.chunk_size = Some(chunk_size);
        Ok(self)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Process every document and aggregate the outcomes.
    ///
    /// Never fails: per-document errors and panics become failed results.
    #[instrument(skip_all, fields(total = documents.len(), max_concurrent = self.max_concurrent))]
    pub async fn process_documents<D, P>(
        &self,
        documents: &[D],
        processor: Arc<P>,
        batch_id: Option<String>,
    ) -> BatchResult
    where
        D: SourceLabel + Clone + Send + Sync + 'static,
        P: DocumentProcessor<D> + ?Sized + 'static,
    {
        let batch_id = batch_id.unwrap_or_else(|| BatchId::new().to_string());
        let start = Instant::now();
        info!(%batch_id, total = documents.len(), "starting batch");

        let completed = Arc::new(AtomicUsize::new(0));
        let total = documents.len();
        let results = match self.chunk_size {
            Some(size) if total > size => {
                let mut results = Vec::with_capacity(total);
                for (n, chunk) in documents.chunks(size).enumerate() {
                    let chunk_id = format!("{batch_id}_chunk_{}", n + 1);
                    debug!(%chunk_id, documents = chunk.len(), "running sub-batch");
                    let ctx = self.context(&chunk_id, &completed, total);
                    results.extend(self.run(chunk, &processor, ctx).await);
                }
                results
            }
            _ => {
                let ctx = self.context(&batch_id, &completed, total);
                self.run(documents, &processor, ctx).await
            }
        };

        let batch = BatchResult::from_results(batch_id, results, start.elapsed());
        info!(
            batch_id = batch.batch_id(),
            total = batch.total_documents(),
            successful = batch.successful_documents(),
            failed = batch.failed_documents(),
            elapsed_ms = batch.processing_time().as_millis() as u64,
            "batch finished"
        );
        batch
    }

    fn context(&self, batch_id: &str, completed: &Arc<AtomicUsize>, total: usize) -> Arc<RunContext> {
        Arc::new(RunContext {
            batch_id: batch_id.to_string(),
            semaphore: Arc::clone(&self.semaphore),
            registry: Arc::clone(&self.registry),
            progress: Arc::clone(&self.progress),
            completed: Arc::clone(completed),
            total,
        })
    }

    async fn run<D, P>(&self, documents: &[D], processor: &Arc<P>, ctx: Arc<RunContext>) -> Vec<ProcessingResult>
    where
        D: SourceLabel + Clone + Send + Sync + 'static,
        P: DocumentProcessor<D> + ?Sized + 'static,
    {
        let mut handles = Vec::with_capacity(documents.len());
        for document in documents {
            let operation_id = new_operation_id(&ctx.batch_id);
            let source = document.source_label();
            let handle = tokio::spawn(
                run_document(
                    Arc::clone(&ctx),
                    Arc::clone(processor),
                    document.clone(),
                    operation_id.clone(),
                    source.clone(),
                )
                .in_current_span(),
            );
            handles.push((operation_id, source, handle));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (operation_id, source, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(err) => {
                    let message = join_error_message(err);
                    warn!(%operation_id, %source, error = %message, "document task aborted");
                    ctx.registry.fail(&operation_id, &message);
                    let result = ProcessingResult::failed(operation_id, source, message, Duration::ZERO);
                    ctx.finish(&result);
                    result
                }
            };
            results.push(result);
        }
        results
    }

    /// Every operation currently retained by the registry.
    pub fn active_operations(&self) -> Vec<OperationRecord> {
        self.registry.snapshot()
    }

    /// Status of one operation, if still retained.
    pub fn operation_status(&self, operation_id: &str) -> Option<OperationRecord> {
        self.registry.get(operation_id)
    }

    pub fn processing_stats(&self) -> ProcessingStats {
        ProcessingStats {
            max_concurrent: self.max_concurrent,
            active_operations: self.registry.len(),
            completed_operations: self.registry.count(OperationStatus::Completed),
            failed_operations: self.registry.count(OperationStatus::Failed),
            processing_operations: self.registry.count(OperationStatus::Processing),
            available_slots: self.semaphore.available_permits(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-document task
// ---------------------------------------------------------------------------

struct RunContext {
    batch_id: String,
    semaphore: Arc<Semaphore>,
    registry: Arc<OperationRegistry>,
    progress: Arc<dyn BatchProgress>,
    completed: Arc<AtomicUsize>,
    total: usize,
}

impl RunContext {
    fn finish(&self, result: &ProcessingResult) {
        let done = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress.document_finished(result, done, self.total);
    }
}

async fn run_document<D, P>(
    ctx: Arc<RunContext>,
    processor: Arc<P>,
    document: D,
    operation_id: String,
    source: String,
) -> ProcessingResult
where
    D: Send + Sync + 'static,
    P: DocumentProcessor<D> + ?Sized + 'static,
{
    let Ok(permit) = Arc::clone(&ctx.semaphore).acquire_owned().await else {
        let result = ProcessingResult::failed(operation_id, source, "admission gate closed", Duration::ZERO);
        ctx.finish(&result);
        return result;
    };

    ctx.registry.start(&operation_id, &ctx.batch_id, &source);
    ctx.progress.document_started(&source);
    debug!(%operation_id, %source, "processing document");

    let started = Instant::now();
    let outcome = processor.process(&document).await;
    let elapsed = started.elapsed();

    let result = match outcome {
        Ok(payload) => {
            ctx.registry.complete(&operation_id);
            debug!(%operation_id, %source, elapsed_ms = elapsed.as_millis() as u64, "document completed");
            ProcessingResult::succeeded(operation_id, source, payload, elapsed)
        }
        Err(err) => {
            let message = err.to_string();
            warn!(%operation_id, %source, error = %message, "document failed");
            ctx.registry.fail(&operation_id, &message);
            ProcessingResult::failed(operation_id, source, message, elapsed)
        }
    };
    drop(permit);

    ctx.finish(&result);
    result
}

fn new_operation_id(batch_id: &str) -> String {
    format!("{batch_id}_{}", Uuid::now_v7().simple())
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return format!("processor task cancelled: {err}");
    }
    let panic = err.into_panic();
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    format!("processor panicked: {detail}")
}
