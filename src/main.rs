//! dagcache - maintenance CLI for the result cache's persisted state
//!
//! CLI entry point that dispatches to subcommands.

use clap::Parser;
use console::style;
use dagcache::cli::{Cli, Commands};
use dagcache::config::{ConfigManager, LogSettings};
use dagcache::error::CacheResult;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

async fn run() -> CacheResult<()> {
    let cli = Cli::parse();

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;

    init_logging(cli.verbose, &config.log);
    debug!("Loaded configuration from {}", manager.path().display());

    match cli.command {
        Commands::Store(args) => dagcache::cli::commands::store(args, &config).await,
        Commands::Config(args) => dagcache::cli::commands::config(args, &config, &manager).await,
    }
}

/// 0 = configured level, 1 = info, 2+ = debug
fn init_logging(verbose: u8, settings: &LogSettings) {
    let filter = match verbose {
        0 => EnvFilter::new(format!("dagcache={}", settings.level)),
        1 => EnvFilter::new("dagcache=info"),
        _ => EnvFilter::new("dagcache=debug"),
    };

    if settings.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .with_writer(std::io::stderr)
            .init();
    }
}
