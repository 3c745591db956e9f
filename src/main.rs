//! safever - Minimum Safe Version auditor
//!
//! Computes, for each product in a curated catalog, the lowest release
//! free of medium-or-worse CVEs, with extra weight on vulnerabilities
//! under active exploitation.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod aggregator;
mod batch;
mod cancel;
mod catalog;
mod cli;
mod config;
mod coordinator;
mod error;
mod filecache;
mod http;
mod msvcache;
mod ratelimit;
mod scoring;
mod sources;
mod version;

use cli::Commands;

// Re-export error types for library users
pub use error::{Result as SafeverResult, SafeverError};

/// Minimum Safe Version auditor
#[derive(Parser)]
#[command(name = "safever")]
#[command(version)]
#[command(about = "Minimum Safe Version auditor", long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to config file
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Path to a catalog file (defaults to the embedded catalog)
    #[arg(long, global = true)]
    catalog: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = config::Config::load(cli.config.as_deref())?;

    let catalog = match &cli.catalog {
        Some(path) => catalog::Catalog::load(path)
            .map_err(|e| SafeverError::CatalogLoad(e.to_string()))?,
        None => catalog::Catalog::load_default()?,
    };
    tracing::debug!(
        "catalog loaded: {} products, metadata {}",
        catalog.entries().len(),
        catalog.metadata()
    );

    cli::execute(cli.command, config, catalog)
}
