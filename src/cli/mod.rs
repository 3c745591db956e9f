//! Command-line interface for safever

use anyhow::Result;
use clap::{Subcommand, ValueEnum};

use crate::cancel::CancelToken;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::coordinator::Coordinator;

mod check;
mod query;
mod refresh;

/// Output rendering for query and check results
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Markdown,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Markdown => write!(f, "markdown"),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Query the minimum safe version of one product
    Query {
        /// Product name, alias, or catalog id
        name: String,

        /// Installed version, for the compliance verdict
        #[arg(long)]
        version: Option<String>,

        /// Drop cached results and re-aggregate from all sources
        #[arg(long)]
        force: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Check a list of installed software against their MSVs
    Check {
        /// Path to an input file (one `name,version` per line, or a JSON
        /// array of {software, version}), or an inline comma-separated
        /// list of `name@version` items
        input: String,

        /// Number of parallel workers
        #[arg(long)]
        concurrency: Option<usize>,

        /// Check items one at a time
        #[arg(long)]
        no_parallel: bool,

        /// Drop cached results and re-aggregate from all sources
        #[arg(long)]
        force: bool,

        /// Output format
        #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
        format: OutputFormat,
    },

    /// Force a CISA KEV catalog refresh
    Refresh,
}

/// Dispatch a parsed command
pub fn execute(command: Commands, config: Config, catalog: Catalog) -> Result<()> {
    let cancel = CancelToken::new();
    let coordinator = Coordinator::new(config, catalog, cancel.clone())?;

    match command {
        Commands::Query {
            name,
            version,
            force,
            format,
        } => query::run(&coordinator, &name, version.as_deref(), force, format),
        Commands::Check {
            input,
            concurrency,
            no_parallel,
            force,
            format,
        } => check::run(
            &coordinator,
            &input,
            concurrency,
            no_parallel,
            force,
            format,
            &cancel,
        ),
        Commands::Refresh => refresh::run(&coordinator),
    }
}
