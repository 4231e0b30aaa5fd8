//! Core domain types for docflow document descriptors.

use std::path::Path;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{DocflowError, Result};

/// Free-form document metadata (JSON object).
pub type Metadata = serde_json::Map<String, serde_json::Value>;

// ---------------------------------------------------------------------------
// BatchId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for generated batch identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl BatchId {
    /// Generate a new time-sortable batch identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// SourceType / SourceKind
// ---------------------------------------------------------------------------

/// Where a document's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// A path on the local filesystem.
    File,
    /// An `http://` or `https://` URL.
    Url,
    /// Inline content, base64-encoded (or raw text).
    Base64,
}

impl SourceType {
    /// Infer the source type of a raw source string.
    ///
    /// URL scheme prefix ⇒ `Url`; existing filesystem path ⇒ `File`;
    /// anything else is treated as inline `Base64` content.
    pub fn detect(source: &str) -> Self {
        if is_http_url(source) {
            Self::Url
        } else if Path::new(source).exists() {
            Self::File
        } else {
            Self::Base64
        }
    }

    /// Lowercase identifier used in reports and metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Url => "url",
            Self::Base64 => "base64",
        }
    }
}

impl std::fmt::Display for SourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SourceType {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "url" => Ok(Self::Url),
            "base64" => Ok(Self::Base64),
            other => Err(DocflowError::validation(format!(
                "unknown source type '{other}': expected file, url, or base64"
            ))),
        }
    }
}

/// A requested source type, which may ask for auto-detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Detect from the source string (see [`SourceType::detect`]).
    #[default]
    Auto,
    File,
    Url,
    Base64,
}

impl SourceKind {
    /// Resolve to a concrete [`SourceType`] for `source`.
    pub fn resolve(self, source: &str) -> SourceType {
        match self {
            Self::Auto => SourceType::detect(source),
            Self::File => SourceType::File,
            Self::Url => SourceType::Url,
            Self::Base64 => SourceType::Base64,
        }
    }
}

impl From<SourceType> for SourceKind {
    fn from(value: SourceType) -> Self {
        match value {
            SourceType::File => Self::File,
            SourceType::Url => Self::Url,
            SourceType::Base64 => Self::Base64,
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = DocflowError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<SourceType>().map(Self::from)
    }
}

/// Whether `source` starts with an HTTP(S) scheme.
pub fn is_http_url(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

// ---------------------------------------------------------------------------
// DocumentInput
// ---------------------------------------------------------------------------

/// A uniform document descriptor produced by an input source.
///
/// Fields are read-only after construction; providers build one per
/// enumerated document and the batch core only ever borrows it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInput {
    source: String,
    source_type: SourceType,
    #[serde(default)]
    metadata: Metadata,
}

impl DocumentInput {
    /// Create a descriptor with explicit type and metadata.
    pub fn new(source: impl Into<String>, source_type: SourceType, metadata: Metadata) -> Self {
        Self {
            source: source.into(),
            source_type,
            metadata,
        }
    }

    /// A local file document with no metadata.
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(path, SourceType::File, Metadata::new())
    }

    /// A URL document with no metadata.
    pub fn url(url: impl Into<String>) -> Self {
        Self::new(url, SourceType::Url, Metadata::new())
    }

    /// An inline (base64) document with no metadata.
    pub fn base64(content: impl Into<String>) -> Self {
        Self::new(content, SourceType::Base64, Metadata::new())
    }

    /// Build a descriptor from a raw source string, detecting its type.
    pub fn detect(source: impl Into<String>) -> Self {
        let source = source.into();
        let source_type = SourceType::detect(&source);
        Self::new(source, source_type, Metadata::new())
    }

    /// Return a copy with an extra metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn source_type(&self) -> SourceType {
        self.source_type
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_url_file_and_inline() {
        assert_eq!(SourceType::detect("https://example.com/a.pdf"), SourceType::Url);
        assert_eq!(SourceType::detect("http://example.com"), SourceType::Url);

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("doc.md");
        std::fs::write(&path, "# Doc").expect("write");
        assert_eq!(
            SourceType::detect(path.to_str().expect("utf8 path")),
            SourceType::File
        );

        assert_eq!(SourceType::detect("SGVsbG8gd29ybGQ="), SourceType::Base64);
        assert_eq!(SourceType::detect("/definitely/not/here.pdf"), SourceType::Base64);
    }

    #[test]
    fn source_kind_parsing() {
        assert_eq!("auto".parse::<SourceKind>().unwrap(), SourceKind::Auto);
        assert_eq!("URL".parse::<SourceKind>().unwrap(), SourceKind::Url);
        assert!("ftp".parse::<SourceKind>().is_err());
        assert_eq!(SourceKind::File.resolve("https://x.dev"), SourceType::File);
    }

    #[test]
    fn document_input_serialization() {
        let doc = DocumentInput::url("https://example.com/guide")
            .with_metadata("domain", "example.com");
        let json = serde_json::to_value(&doc).expect("serialize");
        assert_eq!(json["source_type"], "url");
        assert_eq!(json["metadata"]["domain"], "example.com");

        let parsed: DocumentInput = serde_json::from_value(json).expect("deserialize");
        assert_eq!(parsed, doc);
    }

    #[test]
    fn batch_id_is_unique() {
        assert_ne!(BatchId::new(), BatchId::new());
    }
}
