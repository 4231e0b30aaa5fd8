//! Shared types, error model, and configuration for docflow.
//!
//! This crate is the foundation depended on by all other docflow crates.
//! It provides:
//! - [`DocflowError`]: the unified error type
//! - Domain types ([`DocumentInput`], [`SourceType`], [`SourceKind`], [`BatchId`])
//! - Configuration ([`AppConfig`], [`BatchConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BatchConfig, ConversionConfig, DefaultsConfig, EmbeddingConfig, RetryConfig,
    SitemapConfig, StorageConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, output_dir_override, validate_api_key, validate_range,
};
pub use error::{DocflowError, Result};
pub use types::{BatchId, DocumentInput, Metadata, SourceKind, SourceType, is_http_url};
