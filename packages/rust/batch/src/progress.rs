//! Progress observation for batch runs.

use crate::result::ProcessingResult;

/// Callback for reporting per-document batch progress.
pub trait BatchProgress: Send + Sync {
    /// Called once a document holds a permit and starts processing.
    fn document_started(&self, source: &str);
    /// Called when a document settles; `completed` counts settled documents in this run.
    fn document_finished(&self, result: &ProcessingResult, completed: usize, total: usize);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl BatchProgress for SilentProgress {
    fn document_started(&self, _source: &str) {}
    fn document_finished(&self, _result: &ProcessingResult, _completed: usize, _total: usize) {}
}
