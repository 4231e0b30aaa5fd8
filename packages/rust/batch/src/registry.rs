//! Bounded registry of in-flight and recently settled operations.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Default number of operations retained.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 100;

/// Lifecycle state of a registered operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Processing,
    Completed,
    Failed,
}

/// One registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct OperationRecord {
    pub operation_id: String,
    pub batch_id: String,
    /// Source label of the document being processed.
    pub document: String,
    pub status: OperationStatus,
    pub start_time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip)]
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<String, OperationRecord>,
    next_seq: u64,
}

/// Operation registry owned by a batch processor.
///
/// Never holds more than `capacity` entries: whenever an insert or a
/// settle pushes it over, the oldest entries (by start time, then
/// insertion order) are dropped under the same lock.
#[derive(Debug)]
pub struct OperationRegistry {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_CAPACITY)
    }
}

impl OperationRegistry {
    /// Create a registry retaining at most `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new `processing` entry.
    pub fn start(&self, operation_id: &str, batch_id: &str, document: &str) {
        let mut inner = self.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.entries.insert(
            operation_id.to_string(),
            OperationRecord {
                operation_id: operation_id.to_string(),
                batch_id: batch_id.to_string(),
                document: document.to_string(),
                status: OperationStatus::Processing,
                start_time: Utc::now(),
                end_time: None,
                error: None,
                seq,
            },
        );
        evict_overflow(&mut inner, self.capacity);
    }

    /// Mark an entry completed.
    pub fn complete(&self, operation_id: &str) {
        self.settle(operation_id, OperationStatus::Completed, None);
    }

    /// Mark an entry failed with the error text.
    pub fn fail(&self, operation_id: &str, error: impl Into<String>) {
        self.settle(operation_id, OperationStatus::Failed, Some(error.into()));
    }

    fn settle(&self, operation_id: &str, status: OperationStatus, error: Option<String>) {
        let mut inner = self.lock();
        // An entry may already have been evicted when the cap is smaller than
        // the number of in-flight operations.
        if let Some(record) = inner.entries.get_mut(operation_id) {
            record.status = status;
            record.end_time = Some(Utc::now());
            record.error = error;
        }
        evict_overflow(&mut inner, self.capacity);
    }

    /// Look up one entry.
    pub fn get(&self, operation_id: &str) -> Option<OperationRecord> {
        self.lock().entries.get(operation_id).cloned()
    }

    /// All entries in insertion order.
    pub fn snapshot(&self) -> Vec<OperationRecord> {
        let mut records: Vec<_> = self.lock().entries.values().cloned().collect();
        records.sort_by_key(|r| r.seq);
        records
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count entries in the given state.
    pub fn count(&self, status: OperationStatus) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|r| r.status == status)
            .count()
    }
}

fn evict_overflow(inner: &mut Inner, capacity: usize) {
    while inner.entries.len() > capacity {
        let oldest = inner
            .entries
            .values()
            .min_by_key(|r| (r.start_time, r.seq))
            .map(|r| r.operation_id.clone());
        match oldest {
            Some(id) => {
                inner.entries.remove(&id);
            }
            None => break,
        }
    }
}
