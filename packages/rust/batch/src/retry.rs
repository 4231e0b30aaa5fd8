//! Retry rounds over the failing subset of a batch.

use std::sync::Arc;
use std::time::{Duration, Instant};

use docflow_shared::BatchId;
use tracing::{info, instrument};

use crate::processor::{BatchProcessor, DocumentProcessor, SourceLabel};
use crate::result::{BatchResult, ProcessingResult};

/// How many extra rounds failed documents get. `0` disables retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    pub fn disabled() -> Self {
        Self { max_retries: 0 }
    }
}

/// Every batch run for one logical batch, plus each document's latest attempt.
#[derive(Debug, Clone)]
pub struct RetryOutcome {
    batch_id: String,
    initial: BatchResult,
    rounds: Vec<BatchResult>,
    attempts: Vec<u32>,
    latest: Vec<ProcessingResult>,
    processing_time: Duration,
}

impl RetryOutcome {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// The first pass over every document.
    pub fn initial(&self) -> &BatchResult {
        &self.initial
    }

    /// One batch per retry round that actually ran.
    pub fn rounds(&self) -> &[BatchResult] {
        &self.rounds
    }

    /// Attempts made per input document.
    pub fn attempts(&self) -> &[u32] {
        &self.attempts
    }

    /// Whether document `index` needed more than one attempt.
    pub fn was_retried(&self, index: usize) -> bool {
        self.attempts.get(index).is_some_and(|&n| n > 1)
    }

    /// Latest attempt per document, in input order.
    pub fn latest(&self) -> &[ProcessingResult] {
        &self.latest
    }

    /// Aggregate of the latest attempts, timed across all rounds.
    pub fn final_result(&self) -> BatchResult {
        BatchResult::from_results(self.batch_id.clone(), self.latest.clone(), self.processing_time)
    }
}

/// Run `documents` once, then re-run only the failures for up to
/// `policy.max_retries` rounds, stopping early once nothing fails.
#[instrument(skip_all, fields(total = documents.len(), max_retries = policy.max_retries))]
pub async fn run_with_retries<D, P>(
    batch: &BatchProcessor,
    documents: &[D],
    processor: Arc<P>,
    batch_id: Option<String>,
    policy: RetryPolicy,
) -> RetryOutcome
where
    D: SourceLabel + Clone + Send + Sync + 'static,
    P: DocumentProcessor<D> + ?Sized + 'static,
{
    let batch_id = batch_id.unwrap_or_else(|| BatchId::new().to_string());
    let start = Instant::now();

    let initial = batch
        .process_documents(documents, Arc::clone(&processor), Some(batch_id.clone()))
        .await;
    let mut latest = initial.results().to_vec();
    let mut attempts = vec![1u32; documents.len()];
    let mut rounds = Vec::new();

    for round in 1..=policy.max_retries {
        let failing: Vec<usize> = latest
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.is_success())
            .map(|(i, _)| i)
            .collect();
        if failing.is_empty() {
            break;
        }

        info!(%batch_id, round, failing = failing.len(), "retrying failed documents");
        let retry_docs: Vec<D> = failing.iter().map(|&i| documents[i].clone()).collect();
        let retry = batch
            .process_documents(
                &retry_docs,
                Arc::clone(&processor),
                Some(format!("{batch_id}_retry_{round}")),
            )
            .await;

        for (&index, result) in failing.iter().zip(retry.results()) {
            latest[index] = result.clone();
            attempts[index] += 1;
        }
        rounds.push(retry);
    }

    let outcome = RetryOutcome {
        batch_id,
        initial,
        rounds,
        attempts,
        latest,
        processing_time: start.elapsed(),
    };
    info!(
        batch_id = outcome.batch_id(),
        rounds = outcome.rounds().len(),
        still_failing = outcome.latest().iter().filter(|r| !r.is_success()).count(),
        "retry orchestration finished"
    );
    outcome
}
