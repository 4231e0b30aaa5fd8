//! Per-attempt and per-batch result records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one processing attempt for one document.
///
/// Only [`ProcessingResult::succeeded`] and [`ProcessingResult::failed`]
/// build values, so a success never carries an error and a failure never
/// carries a payload. Deserialization enforces the same rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawProcessingResult")]
pub struct ProcessingResult {
    operation_id: String,
    source: String,
    success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(with = "duration_secs")]
    processing_time: Duration,
    timestamp: DateTime<Utc>,
}

/// Wire form of [`ProcessingResult`], checked before conversion.
#[derive(Deserialize)]
struct RawProcessingResult {
    operation_id: String,
    source: String,
    success: bool,
    #[serde(default)]
    result: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(with = "duration_secs")]
    processing_time: Duration,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawProcessingResult> for ProcessingResult {
    type Error = String;

    fn try_from(raw: RawProcessingResult) -> Result<Self, Self::Error> {
        match (raw.success, &raw.result, &raw.error) {
            (true, _, Some(_)) => {
                return Err(format!("successful result for '{}' carries an error", raw.source));
            }
            (false, Some(_), _) => {
                return Err(format!("failed result for '{}' carries a payload", raw.source));
            }
            (false, _, None) => {
                return Err(format!("failed result for '{}' has no error", raw.source));
            }
            _ => {}
        }
        Ok(Self {
            operation_id: raw.operation_id,
            source: raw.source,
            success: raw.success,
            result: raw.result,
            error: raw.error,
            processing_time: raw.processing_time,
            timestamp: raw.timestamp,
        })
    }
}

impl ProcessingResult {
    pub fn succeeded(
        operation_id: impl Into<String>,
        source: impl Into<String>,
        payload: serde_json::Value,
        processing_time: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            source: source.into(),
            success: true,
            result: Some(payload),
            error: None,
            processing_time,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(
        operation_id: impl Into<String>,
        source: impl Into<String>,
        error: impl Into<String>,
        processing_time: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            source: source.into(),
            success: false,
            result: None,
            error: Some(error.into()),
            processing_time,
            timestamp: Utc::now(),
        }
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    /// Processor payload (successes only).
    pub fn result(&self) -> Option<&serde_json::Value> {
        self.result.as_ref()
    }

    /// Error text (failures only).
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Aggregate of one batch run: one result per input document, in input order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    batch_id: String,
    total_documents: usize,
    successful_documents: usize,
    failed_documents: usize,
    #[serde(with = "duration_secs")]
    processing_time: Duration,
    results: Vec<ProcessingResult>,
    timestamp: DateTime<Utc>,
}

impl BatchResult {
    /// Build the aggregate, deriving the counters from `results`.
    pub fn from_results(
        batch_id: impl Into<String>,
        results: Vec<ProcessingResult>,
        processing_time: Duration,
    ) -> Self {
        let successful_documents = results.iter().filter(|r| r.is_success()).count();
        Self {
            batch_id: batch_id.into(),
            total_documents: results.len(),
            successful_documents,
            failed_documents: results.len() - successful_documents,
            processing_time,
            results,
            timestamp: Utc::now(),
        }
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn total_documents(&self) -> usize {
        self.total_documents
    }

    pub fn successful_documents(&self) -> usize {
        self.successful_documents
    }

    pub fn failed_documents(&self) -> usize {
        self.failed_documents
    }

    /// Wall clock from batch start until every task settled.
    pub fn processing_time(&self) -> Duration {
        self.processing_time
    }

    /// `results()[i]` is the outcome for input document `i`.
    pub fn results(&self) -> &[ProcessingResult] {
        &self.results
    }

    pub fn into_results(self) -> Vec<ProcessingResult> {
        self.results
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Share of successful documents, 0.0 for an empty batch.
    pub fn success_rate(&self) -> f64 {
        if self.total_documents == 0 {
            0.0
        } else {
            self.successful_documents as f64 / self.total_documents as f64
        }
    }
}

/// Serialize a `Duration` as fractional seconds.
pub mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
