//! CLI entry point for lazywrite.
//!
//! This binary provides the `lazywrite` command with subcommands for
//! replaying an intent log through the persistence queue and for inspecting
//! the effective configuration.

mod cli;
mod config;
mod record;
mod replay;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::config::LazywriteConfig;

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = LazywriteConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Replay {
            input,
            out,
            pace_ms,
        } => {
            init_tracing(&config.log_level);
            let report = replay::run(&input, &out, config.queue, Duration::from_millis(pace_ms))
                .await?;
            let rendered =
                serde_json::to_string_pretty(&report).context("failed to render replay report")?;
            println!("{rendered}");
        }
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Logs go to stderr; stdout carries the command's output.
fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}
