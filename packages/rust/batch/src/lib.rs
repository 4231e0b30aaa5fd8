//! Concurrent batch-processing core for docflow.
//!
//! Fans per-document jobs out under a bounded admission gate, tracks
//! every attempt in an operation registry, and aggregates positional
//! results. Retry orchestration re-runs only the failing subset.

pub mod processor;
pub mod progress;
pub mod registry;
pub mod result;
pub mod retry;

pub use processor::{
    BatchProcessor, DocumentProcessor, FnProcessor, ProcessingStats, SourceLabel, processor_fn,
};
pub use progress::{BatchProgress, SilentProgress};
pub use registry::{DEFAULT_REGISTRY_CAPACITY, OperationRecord, OperationRegistry, OperationStatus};
pub use result::{BatchResult, ProcessingResult, duration_secs};
pub use retry::{RetryOutcome, RetryPolicy, run_with_retries};
