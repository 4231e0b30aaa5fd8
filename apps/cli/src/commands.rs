//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use docflow_batch::{BatchProgress, ProcessingResult};
use docflow_core::{
    ExportFormat, IngestRequest, MixedSources, OpenAiEmbedder, Pipeline, PipelineReport,
    SearchRequest, search, write_export,
};
use docflow_shared::{AppConfig, BatchConfig, SourceKind, init_config, load_config};
use docflow_storage::{BatchRunRecord, Storage};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// docflow: convert document sources to Markdown in bulk.
#[derive(Parser)]
#[command(
    name = "docflow",
    version,
    about = "Convert folders, URL lists and sitemaps to Markdown, and index them for search.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Options shared by every converting command. Unset flags fall back to
/// the config file.
#[derive(Args, Debug, Clone)]
pub(crate) struct BatchArgs {
    /// Maximum documents processed at once.
    #[arg(short = 'c', long)]
    pub max_concurrent: Option<usize>,

    /// Output directory for Markdown (overrides config and MD_OUTPUT_FOLDER).
    #[arg(short, long)]
    pub out: Option<PathBuf>,

    /// Do not retry failed documents.
    #[arg(long)]
    pub no_retry: bool,

    /// Retry rounds for failed documents.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Describe images with a vision model (needs the API key env var).
    #[arg(long)]
    pub annotate_images: bool,

    /// Download images next to each document.
    #[arg(long)]
    pub save_images: bool,

    /// Print the full report as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Convert a single document (path, URL or base64 content).
    Convert {
        /// Source to convert.
        source: String,

        /// Source type: auto, file, url or base64.
        #[arg(short = 't', long = "type", default_value = "auto")]
        source_type: SourceKind,

        /// Output file name without extension.
        #[arg(short, long)]
        name: Option<String>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Convert a list of sources (paths or URLs, auto-detected).
    Batch {
        /// Sources to convert.
        #[arg(required = true)]
        sources: Vec<String>,

        /// Run the list as sub-batches of this many documents.
        #[arg(long)]
        batch_size: Option<usize>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Convert every matching file in a folder.
    Folder {
        /// Folder to scan.
        path: PathBuf,

        /// Glob pattern relative to the folder (repeatable, e.g. "**/*.md").
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Convert the pages listed by a sitemap.
    Sitemap {
        /// Sitemap (or site) URL.
        url: String,

        /// Maximum pages to convert.
        #[arg(long)]
        max_urls: Option<usize>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Convert folders, URLs and sitemaps in one batch.
    Mixed {
        /// Folder to scan (repeatable).
        #[arg(long = "folder")]
        folders: Vec<PathBuf>,

        /// URL to convert (repeatable).
        #[arg(long = "url")]
        urls: Vec<String>,

        /// Sitemap URL (repeatable).
        #[arg(long = "sitemap")]
        sitemaps: Vec<String>,

        /// Folder glob pattern (repeatable).
        #[arg(short, long = "pattern")]
        patterns: Vec<String>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// Convert, chunk, embed and store pages in a vector collection.
    Ingest {
        /// Entry URL.
        url: String,

        /// Collection name.
        #[arg(long, default_value = docflow_core::ingest::DEFAULT_COLLECTION)]
        collection: String,

        /// Index only the given page, without discovering linked pages.
        #[arg(long)]
        single_page: bool,

        /// Maximum pages to index.
        #[arg(long, default_value = "100")]
        max_urls: usize,

        /// Maximum estimated tokens per chunk (defaults to config).
        #[arg(long)]
        max_tokens: Option<usize>,

        /// Extra metadata stored with every chunk (repeatable key=value).
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,

        #[command(flatten)]
        batch: BatchArgs,
    },

    /// List recent batch runs.
    Runs {
        /// Number of runs to show.
        #[arg(short = 'n', long, default_value = "20")]
        limit: u32,

        /// Print the stored report of one run as JSON.
        #[arg(long)]
        show: Option<String>,
    },

    /// Export a stored run report.
    Export {
        /// Batch ID of the run.
        batch_id: String,

        /// Format: json, csv, markdown or html.
        #[arg(short, long, default_value = "json")]
        format: ExportFormat,

        /// Output file, or directory for a generated file name.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// List vector collections.
    Collections,

    /// Search stored chunks by similarity.
    Search {
        /// Query text.
        query: String,

        /// Restrict to one collection.
        #[arg(long)]
        collection: Option<String>,

        /// Number of results.
        #[arg(short = 'k', long, default_value = "5")]
        top_k: usize,

        /// Minimum cosine similarity (0-1).
        #[arg(long, default_value = "0.7")]
        threshold: f32,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "docflow=info",
        1 => "docflow=debug",
        _ => "docflow=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Convert {
            source,
            source_type,
            name,
            batch,
        } => cmd_convert(&source, source_type, name.as_deref(), &batch).await,
        Command::Batch {
            sources,
            batch_size,
            batch,
        } => cmd_batch(&sources, batch_size, &batch).await,
        Command::Folder {
            path,
            patterns,
            batch,
        } => cmd_folder(&path, &patterns, &batch).await,
        Command::Sitemap {
            url,
            max_urls,
            batch,
        } => cmd_sitemap(&url, max_urls, &batch).await,
        Command::Mixed {
            folders,
            urls,
            sitemaps,
            patterns,
            batch,
        } => {
            let sources = MixedSources {
                folders,
                urls,
                sitemaps,
                file_patterns: patterns,
            };
            cmd_mixed(&sources, &batch).await
        }
        Command::Ingest {
            url,
            collection,
            single_page,
            max_urls,
            max_tokens,
            metadata,
            batch,
        } => {
            let mut request = IngestRequest::new(url);
            request.collection = collection;
            request.follow_links = !single_page;
            request.max_urls = max_urls;
            request.max_tokens = max_tokens;
            for (key, value) in metadata {
                request.metadata.insert(key, value.into());
            }
            cmd_ingest(&request, &batch).await
        }
        Command::Runs { limit, show } => cmd_runs(limit, show.as_deref()).await,
        Command::Export {
            batch_id,
            format,
            out,
        } => cmd_export(&batch_id, format, out.as_deref()).await,
        Command::Collections => cmd_collections().await,
        Command::Search {
            query,
            collection,
            top_k,
            threshold,
        } => {
            let mut request = SearchRequest::new(query);
            request.collection = collection;
            request.top_k = top_k;
            request.threshold = threshold;
            cmd_search(&request).await
        }
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

// ---------------------------------------------------------------------------
// Shared plumbing
// ---------------------------------------------------------------------------

/// Config file values with CLI flags applied on top.
fn batch_config(config: &AppConfig, args: &BatchArgs, batch_size: Option<usize>) -> BatchConfig {
    let mut opts = BatchConfig::from(config);
    if let Some(n) = args.max_concurrent {
        opts.max_concurrent = n;
    }
    if let Some(out) = &args.out {
        opts.output_dir = out.clone();
    }
    if args.no_retry {
        opts.retry_failed = false;
    }
    if let Some(n) = args.max_retries {
        opts.max_retries = n;
    }
    opts.annotate_images |= args.annotate_images;
    opts.save_images_as_files |= args.save_images;
    opts.batch_size = batch_size;
    opts
}

/// Build a pipeline that reports progress on an indicatif bar.
fn pipeline(config: AppConfig) -> Result<(Pipeline, Arc<CliProgress>)> {
    let progress = Arc::new(CliProgress::new());
    let pipeline = Pipeline::new(config)?.with_progress(Arc::clone(&progress) as Arc<dyn BatchProgress>);
    Ok((pipeline, progress))
}

async fn open_storage(config: &AppConfig) -> Result<Storage> {
    let path = config.storage.resolve_db_path()?;
    Ok(Storage::open(&path).await?)
}

/// Store, print and map the report to the process exit status.
async fn finish(config: &AppConfig, report: PipelineReport, json: bool) -> Result<()> {
    if let Some(batch_id) = &report.batch_id {
        if let Err(e) = record_run(config, batch_id, &report).await {
            warn!(error = %e, "failed to record batch run");
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if report.success {
        Ok(())
    } else {
        Err(eyre!(
            "{} failed: {}",
            report.tool,
            report.error.as_deref().unwrap_or("unknown error")
        ))
    }
}

async fn record_run(config: &AppConfig, batch_id: &str, report: &PipelineReport) -> Result<()> {
    let storage = open_storage(config).await?;
    storage
        .record_batch_run(&BatchRunRecord {
            batch_id: batch_id.to_string(),
            tool: report.tool.clone(),
            success: report.success,
            total_documents: report.total_documents,
            successful_documents: report.successful_documents,
            failed_documents: report.failed_documents,
            report: serde_json::to_value(report)?,
            created_at: report.timestamp,
        })
        .await?;
    Ok(())
}

fn print_report(report: &PipelineReport) {
    println!();
    if let Some(error) = &report.error {
        if report.total_documents == 0 {
            println!("  {} failed: {error}", report.tool);
            println!();
            return;
        }
    }
    println!("  {}", report.message);
    if let Some(batch_id) = &report.batch_id {
        println!("  Batch:     {batch_id}");
    }
    println!("  Succeeded: {}", report.successful_documents);
    println!("  Failed:    {}", report.failed_documents);
    if report.retry_rounds > 0 {
        println!("  Retries:   {} round(s)", report.retry_rounds);
    }
    println!("  Time:      {:.1}s", report.total_processing_time.as_secs_f64());
    for (key, value) in &report.extra {
        if key != "preview" {
            println!("  {key}: {value}");
        }
    }

    let failures: Vec<_> = report.results.iter().filter(|r| !r.success).collect();
    if !failures.is_empty() {
        println!();
        println!("  Failed documents:");
        for r in failures {
            println!(
                "    {} ({} attempt(s)): {}",
                r.source,
                r.attempts,
                r.error.as_deref().unwrap_or("unknown error")
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// Batch progress on an indicatif bar (stderr).
struct CliProgress {
    bar: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/blue}] {pos}/{len} {wide_msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
        bar.set_style(style);
        Self { bar }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl BatchProgress for CliProgress {
    fn document_started(&self, source: &str) {
        self.bar.set_message(format!("Converting {source}"));
    }

    fn document_finished(&self, result: &ProcessingResult, completed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(completed as u64);
        if !result.is_success() {
            self.bar.println(format!("  failed: {}", result.source()));
        }
    }
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

async fn cmd_convert(
    source: &str,
    kind: SourceKind,
    name: Option<&str>,
    args: &BatchArgs,
) -> Result<()> {
    let config = load_config()?;
    let opts = batch_config(&config, args, None);
    info!(kind = ?kind, out = %opts.output_dir.display(), "converting document");

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline.convert_single(source, kind, name, &opts).await;
    progress.finish();

    if !args.json && report.success {
        if let Some(preview) = report.extra.get("preview").and_then(|p| p.as_str()) {
            println!("{preview}");
        }
    }
    finish(&config, report, args.json).await
}

async fn cmd_batch(sources: &[String], batch_size: Option<usize>, args: &BatchArgs) -> Result<()> {
    let config = load_config()?;
    let batch_size = batch_size.or(Some(config.defaults.batch_size));
    let opts = batch_config(&config, args, batch_size);
    info!(count = sources.len(), max_concurrent = opts.max_concurrent, "processing list");

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline.process_list(sources, &opts).await;
    progress.finish();
    finish(&config, report, args.json).await
}

async fn cmd_folder(path: &Path, patterns: &[String], args: &BatchArgs) -> Result<()> {
    let config = load_config()?;
    let patterns = if patterns.is_empty() {
        config.defaults.file_patterns.clone()
    } else {
        patterns.to_vec()
    };
    let opts = batch_config(&config, args, None);
    info!(folder = %path.display(), ?patterns, "processing folder");

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline.process_folder(path, &patterns, &opts).await;
    progress.finish();
    finish(&config, report, args.json).await
}

async fn cmd_sitemap(url: &str, max_urls: Option<usize>, args: &BatchArgs) -> Result<()> {
    let config = load_config()?;
    let max_urls = max_urls.unwrap_or(config.sitemap.max_urls);
    let opts = batch_config(&config, args, None);
    info!(url, max_urls, "processing sitemap");

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline.process_sitemap(url, max_urls, &opts).await;
    progress.finish();
    finish(&config, report, args.json).await
}

async fn cmd_mixed(sources: &MixedSources, args: &BatchArgs) -> Result<()> {
    let config = load_config()?;
    let mut sources = sources.clone();
    if sources.file_patterns.is_empty() {
        sources.file_patterns = config.defaults.file_patterns.clone();
    }
    let opts = batch_config(&config, args, None);

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline.process_mixed(&sources, &opts).await;
    progress.finish();
    finish(&config, report, args.json).await
}

async fn cmd_ingest(request: &IngestRequest, args: &BatchArgs) -> Result<()> {
    let config = load_config()?;
    let embedder = OpenAiEmbedder::from_config(&config)?;
    let storage = Arc::new(open_storage(&config).await?);
    let opts = batch_config(&config, args, None);
    info!(
        url = %request.url,
        collection = %request.collection,
        model = %config.embedding.model,
        "ingesting"
    );

    let (pipeline, progress) = pipeline(config.clone())?;
    let report = pipeline
        .ingest(request, &opts, Arc::new(embedder), storage)
        .await;
    progress.finish();
    finish(&config, report, args.json).await
}

async fn cmd_runs(limit: u32, show: Option<&str>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;

    if let Some(batch_id) = show {
        let run = storage
            .get_batch_run(batch_id)
            .await?
            .ok_or_else(|| eyre!("no batch run with id '{batch_id}'"))?;
        println!("{}", serde_json::to_string_pretty(&run.report)?);
        return Ok(());
    }

    let runs = storage.list_batch_runs(limit).await?;
    if runs.is_empty() {
        println!("No batch runs recorded yet.");
        return Ok(());
    }
    println!(
        "{:<38} {:<16} {:<7} {:>6} {:>6} {:>6}  {}",
        "BATCH ID", "TOOL", "STATUS", "TOTAL", "OK", "FAILED", "CREATED"
    );
    for run in runs {
        println!(
            "{:<38} {:<16} {:<7} {:>6} {:>6} {:>6}  {}",
            run.batch_id,
            run.tool,
            if run.success { "ok" } else { "failed" },
            run.total_documents,
            run.successful_documents,
            run.failed_documents,
            run.created_at.format("%Y-%m-%d %H:%M:%S"),
        );
    }
    Ok(())
}

async fn cmd_export(batch_id: &str, format: ExportFormat, out: Option<&Path>) -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let run = storage
        .get_batch_run(batch_id)
        .await?
        .ok_or_else(|| eyre!("no batch run with id '{batch_id}'"))?;
    let report: PipelineReport = serde_json::from_value(run.report)?;

    let path = write_export(&report, format, out)?;
    println!("Exported {} results to {}", report.results.len(), path.display());
    Ok(())
}

async fn cmd_collections() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let collections = storage.list_collections().await?;

    if collections.is_empty() {
        println!("No collections yet. Run `docflow ingest <url>` to create one.");
        return Ok(());
    }
    println!(
        "{:<24} {:>8} {:>8}  {}",
        "COLLECTION", "CHUNKS", "SOURCES", "LAST ADDED"
    );
    for c in collections {
        println!(
            "{:<24} {:>8} {:>8}  {}",
            c.name,
            c.chunk_count,
            c.unique_sources,
            c.last_added.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

async fn cmd_search(request: &SearchRequest) -> Result<()> {
    let config = load_config()?;
    let path = config.storage.resolve_db_path()?;
    let storage = Storage::open_readonly(&path).await?;
    let embedder = OpenAiEmbedder::from_config(&config)?;

    let hits = search(&storage, &embedder, request).await?;
    if hits.is_empty() {
        println!("No chunks above similarity {:.2}.", request.threshold);
        return Ok(());
    }
    for (i, hit) in hits.iter().enumerate() {
        println!(
            "{}. [{:.3}] {} (#{} in {})",
            i + 1,
            hit.similarity,
            hit.source_url,
            hit.chunk_index,
            hit.collection
        );
        let snippet: String = hit.chunk_text.chars().take(300).collect();
        println!("   {}", snippet.replace('\n', " "));
        println!();
    }
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::try_parse_from([
            "docflow", "folder", "./docs", "-p", "**/*.md", "-c", "4", "--no-retry", "--out", "/tmp/md",
        ])
        .unwrap();
        let Command::Folder { patterns, batch, .. } = cli.command else {
            panic!("expected folder command");
        };
        assert_eq!(patterns, vec!["**/*.md".to_string()]);

        let opts = batch_config(&AppConfig::default(), &batch, None);
        assert_eq!(opts.max_concurrent, 4);
        assert_eq!(opts.retry_rounds(), 0);
        assert_eq!(opts.output_dir, PathBuf::from("/tmp/md"));
    }

    #[test]
    fn convert_parses_source_kind() {
        let cli = Cli::try_parse_from(["docflow", "convert", "a.pdf", "--type", "file"]).unwrap();
        let Command::Convert { source_type, .. } = cli.command else {
            panic!("expected convert command");
        };
        assert_eq!(source_type, SourceKind::File);

        assert!(Cli::try_parse_from(["docflow", "convert", "a.pdf", "--type", "ftp"]).is_err());
    }

    #[test]
    fn ingest_metadata_pairs() {
        assert_eq!(
            parse_key_value("team = docs").unwrap(),
            ("team".to_string(), "docs".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn export_format_flag() {
        let cli = Cli::try_parse_from(["docflow", "export", "abc", "-f", "md"]).unwrap();
        let Command::Export { format, .. } = cli.command else {
            panic!("expected export command");
        };
        assert_eq!(format, ExportFormat::Markdown);
    }
}
