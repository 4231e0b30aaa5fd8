//! Error types for docflow.
//!
//! Library crates use [`DocflowError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all docflow operations.
#[derive(Debug, thiserror::Error)]
pub enum DocflowError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while fetching a document or sitemap.
    #[error("network error: {0}")]
    Network(String),

    /// HTML, XML, or payload parsing error.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// LLM or embedding API error (image annotation, vector generation).
    #[error("enrichment error: {0}")]
    Enrichment(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad input, unsupported value, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Document conversion error.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Per-document processing error raised by a processor function.
    #[error("processing error: {0}")]
    Processing(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, DocflowError>;

impl DocflowError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether this error belongs to the fail-fast configuration class.
    pub fn is_config(&self) -> bool {
        matches!(self, Self::Config { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = DocflowError::config("max_concurrent must be at least 1");
        assert_eq!(
            err.to_string(),
            "config error: max_concurrent must be at least 1"
        );
        assert!(err.is_config());

        let err = DocflowError::validation("unsupported source type 'ftp'");
        assert!(err.to_string().contains("'ftp'"));
        assert!(!err.is_config());
    }

    #[test]
    fn io_error_keeps_path() {
        let err = DocflowError::io(
            "/tmp/missing.md",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        let msg = err.to_string();
        assert!(msg.contains("missing.md"));
        assert!(msg.contains("gone"));
    }
}
