//! Pipeline orchestration and domain logic for docflow.
//!
//! This crate ties input sources, conversion, persistence, chunking,
//! embedding and storage together into the pipeline tools run by the CLI
//! (e.g., `process_folder`, `ingest`).

pub mod annotate;
pub mod chunking;
pub mod convert;
pub mod document;
pub mod embedding;
pub mod export;
mod extract;
pub mod ingest;
pub mod persist;
pub mod pipeline;
pub mod sources;

pub use annotate::ImageAnnotator;
pub use chunking::{Chunk, chunk_markdown, estimate_tokens};
pub use convert::{
    BuiltinConverter, ConversionRequest, ConvertedDocument, DocumentConverter, DocumentFormat,
};
pub use document::{ConversionOutcome, DocumentService};
pub use embedding::{Embedder, OpenAiEmbedder};
pub use export::{ExportFormat, export, write_export};
pub use ingest::{IngestRequest, SearchRequest, search};
pub use persist::{PersistOutcome, Persister, SavedDocument};
pub use pipeline::{DocumentSummary, MixedSources, Pipeline, PipelineReport};
pub use sources::{FolderSource, InputSource, SitemapSource, UrlListSource};
