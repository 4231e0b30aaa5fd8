//! docflow CLI: batch document conversion, indexing and search.
//!
//! Turns folders, URL lists and sitemaps into Markdown with bounded
//! concurrency, and optionally chunks and embeds them for similarity search.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
