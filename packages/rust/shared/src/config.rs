//! Application configuration for docflow.
//!
//! User config lives at `~/.docflow/docflow.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocflowError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docflow.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docflow";

/// Default database file name inside the config directory.
const DB_FILE_NAME: &str = "docflow.db";

/// Environment variable that overrides the Markdown output folder.
pub const OUTPUT_DIR_ENV: &str = "MD_OUTPUT_FOLDER";

// ---------------------------------------------------------------------------
// Config structs (matching docflow.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Retry policy for failed documents.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Conversion and image handling.
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Sitemap discovery limits.
    #[serde(default)]
    pub sitemap: SitemapConfig,

    /// Chunking and embedding settings.
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Database location.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Folder that receives converted Markdown.
    #[serde(default = "default_output_dir")]
    pub output_dir: String,

    /// Maximum documents processed at the same instant.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Glob patterns used when enumerating folders.
    #[serde(default = "default_file_patterns")]
    pub file_patterns: Vec<String>,

    /// Documents per sub-batch for list processing.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            max_concurrent: default_max_concurrent(),
            file_patterns: default_file_patterns(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_output_dir() -> String {
    "docflow_output".into()
}
fn default_max_concurrent() -> usize {
    10
}
/// Patterns used for folders when none are configured.
pub fn default_file_patterns() -> Vec<String> {
    ["*.pdf", "*.html", "*.docx", "*.md"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_batch_size() -> usize {
    10
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Whether failed documents are retried at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Maximum number of retry rounds.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: default_max_retries(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    2
}

/// `[conversion]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Describe images with a vision model.
    #[serde(default)]
    pub annotate_images: bool,

    /// Download images next to the Markdown instead of linking remotely.
    #[serde(default)]
    pub save_images_as_files: bool,

    /// Vision model used for image descriptions.
    #[serde(default = "default_image_model")]
    pub image_model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Timeout for fetching remote documents.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            annotate_images: false,
            save_images_as_files: false,
            image_model: default_image_model(),
            api_key_env: default_api_key_env(),
            api_base: default_api_base(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

fn default_image_model() -> String {
    "gpt-4o-mini".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_api_base() -> String {
    "https://api.openai.com/v1".into()
}
fn default_fetch_timeout() -> u64 {
    30
}

/// `[sitemap]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitemapConfig {
    /// Maximum URLs taken from one sitemap.
    #[serde(default = "default_max_urls")]
    pub max_urls: usize,

    /// How many levels of nested sitemap indexes to follow.
    #[serde(default = "default_sitemap_depth")]
    pub max_depth: u32,

    /// HTTP timeout for sitemap requests.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// URL path patterns that are never returned.
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl Default for SitemapConfig {
    fn default() -> Self {
        Self {
            max_urls: default_max_urls(),
            max_depth: default_sitemap_depth(),
            timeout_secs: default_fetch_timeout(),
            exclude_patterns: Vec::new(),
        }
    }
}

fn default_max_urls() -> usize {
    100
}
fn default_sitemap_depth() -> u32 {
    2
}

/// `[embedding]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding model identifier.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Upper bound on tokens per chunk.
    #[serde(default = "default_chunk_tokens")]
    pub chunk_max_tokens: usize,

    /// Texts sent per embedding request.
    #[serde(default = "default_embedding_batch")]
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            chunk_max_tokens: default_chunk_tokens(),
            batch_size: default_embedding_batch(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}
fn default_chunk_tokens() -> usize {
    500
}
fn default_embedding_batch() -> usize {
    32
}

/// `[storage]` section.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path. Defaults to `~/.docflow/docflow.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageConfig {
    /// Resolve the database path, falling back to the config directory.
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(p) => Ok(PathBuf::from(p)),
            None => Ok(config_dir()?.join(DB_FILE_NAME)),
        }
    }
}

// ---------------------------------------------------------------------------
// Batch config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime batch configuration, merged from config file and CLI flags.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    /// Admission gate size.
    pub max_concurrent: usize,
    /// Split large lists into sequential sub-batches of this size.
    pub batch_size: Option<usize>,
    /// Whether failures get retry rounds.
    pub retry_failed: bool,
    /// Retry round budget.
    pub max_retries: u32,
    /// Folder for converted Markdown.
    pub output_dir: PathBuf,
    /// Describe images with a vision model.
    pub annotate_images: bool,
    /// Save images next to the Markdown.
    pub save_images_as_files: bool,
}

impl BatchConfig {
    /// Retry rounds actually granted (zero when retries are disabled).
    pub fn retry_rounds(&self) -> u32 {
        if self.retry_failed { self.max_retries } else { 0 }
    }
}

impl From<&AppConfig> for BatchConfig {
    fn from(config: &AppConfig) -> Self {
        let output_dir = output_dir_override()
            .unwrap_or_else(|| PathBuf::from(&config.defaults.output_dir));
        Self {
            max_concurrent: config.defaults.max_concurrent,
            batch_size: None,
            retry_failed: config.retry.enabled,
            max_retries: config.retry.max_retries,
            output_dir,
            annotate_images: config.conversion.annotate_images,
            save_images_as_files: config.conversion.save_images_as_files,
        }
    }
}

/// Output folder from the `MD_OUTPUT_FOLDER` environment variable, if set.
pub fn output_dir_override() -> Option<PathBuf> {
    std::env::var(OUTPUT_DIR_ENV)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

/// Reject `value` outside `min..=max` with a config error naming the field.
pub fn validate_range(name: &str, value: usize, min: usize, max: usize) -> Result<()> {
    if (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(DocflowError::config(format!(
            "{name} must be between {min} and {max} (got {value})"
        )))
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docflow/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| DocflowError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docflow/docflow.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocflowError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DocflowError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocflowError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocflowError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocflowError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the API key from the env var named `var_name`.
pub fn validate_api_key(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(DocflowError::config(format!(
            "{var_name} environment variable is required for image annotation and embeddings but is not set"
        ))),
    }
}
