//! Vector indexing: convert, chunk, embed and store documents, and search
//! the stored chunks.

use std::sync::Arc;

use async_trait::async_trait;
use docflow_batch::DocumentProcessor;
use docflow_shared::{DocflowError, DocumentInput, Metadata, Result};
use docflow_storage::{ChunkRecord, ScoredChunk, SimilarityQuery, Storage};
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::chunking::chunk_markdown;
use crate::convert::{ConversionRequest, DocumentConverter};
use crate::embedding::Embedder;

/// Collection used when none is given.
pub const DEFAULT_COLLECTION: &str = "default_collection";

/// What to index and where.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Entry URL.
    pub url: String,
    pub collection: String,
    /// Index pages discovered from `url` (sitemap or page links), not just `url`.
    pub follow_links: bool,
    pub max_urls: usize,
    /// Overrides `[embedding] chunk_max_tokens`.
    pub max_tokens: Option<usize>,
    /// Copied into every stored chunk's metadata.
    pub metadata: Metadata,
}

impl IngestRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            collection: DEFAULT_COLLECTION.to_string(),
            follow_links: true,
            max_urls: 100,
            max_tokens: None,
            metadata: Metadata::new(),
        }
    }
}

/// Per-document processor used by the `ingest` tool.
///
/// Storage writes for one source (delete old chunks, insert new ones) run
/// under `write_lock` so concurrent documents never interleave them.
pub(crate) struct IngestProcessor {
    pub converter: Arc<dyn DocumentConverter>,
    pub embedder: Arc<dyn Embedder>,
    pub storage: Arc<Storage>,
    pub write_lock: Mutex<()>,
    pub collection: String,
    pub max_tokens: usize,
    pub embed_batch: usize,
    pub metadata: Metadata,
}

#[async_trait]
impl DocumentProcessor<DocumentInput> for IngestProcessor {
    #[instrument(skip_all, fields(source = %document.source(), collection = %self.collection))]
    async fn process(&self, document: &DocumentInput) -> Result<Value> {
        let request = ConversionRequest::new(document.source(), document.source_type());
        let doc = self.converter.convert(&request).await?;

        let chunks = chunk_markdown(&doc.markdown, self.max_tokens);
        if chunks.is_empty() {
            return Err(DocflowError::Processing(format!(
                "no text content to index in {}",
                document.source()
            )));
        }

        let mut embeddings = Vec::with_capacity(chunks.len());
        for group in chunks.chunks(self.embed_batch.max(1)) {
            let texts: Vec<String> = group.iter().map(|c| c.text.clone()).collect();
            embeddings.extend(self.embedder.embed(&texts).await?);
        }

        let mut records = Vec::with_capacity(chunks.len());
        for (chunk, embedding) in chunks.iter().zip(embeddings) {
            let mut metadata = self.metadata.clone();
            metadata.insert("title".into(), json!(doc.title));
            metadata.insert("format".into(), json!(doc.format));
            records.push(ChunkRecord {
                collection: self.collection.clone(),
                source_url: document.source().to_string(),
                chunk_index: chunk.index,
                chunk_text: chunk.text.clone(),
                token_count: chunk.token_count,
                embedding,
                embedding_model: self.embedder.model().to_string(),
                metadata,
            });
        }
        let token_count: usize = records.iter().map(|r| r.token_count).sum();

        let (replaced, stored) = {
            let _guard = self.write_lock.lock().await;
            let replaced = self
                .storage
                .delete_source_chunks(&self.collection, document.source())
                .await?;
            let stored = self.storage.insert_chunks(&records).await?;
            (replaced, stored)
        };
        debug!(chunks = stored, replaced, "document indexed");

        Ok(json!({
            "title": doc.title,
            "format": doc.format,
            "input_type": doc.source_type,
            "content_length": doc.content_length(),
            "chunk_count": stored,
            "token_count": token_count,
            "replaced_chunks": replaced,
        }))
    }
}

/// A similarity query in text form.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub collection: Option<String>,
    pub top_k: usize,
    pub threshold: f32,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            collection: None,
            top_k: SimilarityQuery::DEFAULT_TOP_K,
            threshold: SimilarityQuery::DEFAULT_THRESHOLD,
        }
    }
}

/// Embed `request.query` and return the closest stored chunks, best first.
#[instrument(skip_all, fields(top_k = request.top_k, threshold = request.threshold))]
pub async fn search(
    storage: &Storage,
    embedder: &dyn Embedder,
    request: &SearchRequest,
) -> Result<Vec<ScoredChunk>> {
    if request.query.trim().is_empty() {
        return Err(DocflowError::validation("query must not be empty"));
    }
    if request.top_k == 0 {
        return Err(DocflowError::validation("top_k must be a positive integer"));
    }
    if !(0.0..=1.0).contains(&request.threshold) {
        return Err(DocflowError::validation(
            "similarity threshold must be between 0 and 1",
        ));
    }

    let embedding = embedder
        .embed(std::slice::from_ref(&request.query))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| DocflowError::Enrichment("no embedding returned for query".into()))?;

    let query = SimilarityQuery {
        embedding,
        top_k: request.top_k,
        threshold: request.threshold,
        collection: request.collection.clone(),
    };
    storage.similarity_search(&query).await
}
