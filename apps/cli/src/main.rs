//! sourcewatch CLI: scheduled multi-source content ingestion.
//!
//! Collects new items from a registry of feeds and listing pages, remembers
//! what it has already emitted, and keeps per-source health across runs.

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
