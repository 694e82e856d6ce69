//! CLI argument definitions for lazywrite.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// lazywrite -- debounced record persistence.
#[derive(Parser)]
#[command(
    name = "lazywrite",
    version,
    about = "lazywrite -- debounced record persistence",
    long_about = "Replays a JSON-lines log of record writes through a debounced persistence \
                  queue, coalescing bursts of writes to the same record into a single file write."
)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay an intent log into a directory of JSON records.
    Replay {
        /// JSON-lines file with one `put` or `delete` intent per line.
        input: PathBuf,

        /// Directory the records are written to.  Created if missing.
        #[arg(long, short)]
        out: PathBuf,

        /// Pause between intents, in milliseconds, to mimic a live producer.
        #[arg(long, default_value_t = 0)]
        pace_ms: u64,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_replay_arguments() {
        let cli = Cli::parse_from([
            "lazywrite",
            "replay",
            "intents.jsonl",
            "--out",
            "records",
            "--pace-ms",
            "25",
            "--config",
            "lazywrite.toml",
        ]);

        assert_eq!(cli.config, Some(PathBuf::from("lazywrite.toml")));
        match cli.command {
            Commands::Replay {
                input,
                out,
                pace_ms,
            } => {
                assert_eq!(input, PathBuf::from("intents.jsonl"));
                assert_eq!(out, PathBuf::from("records"));
                assert_eq!(pace_ms, 25);
            }
            Commands::Config => panic!("expected replay"),
        }
    }

    #[test]
    fn replay_requires_output_directory() {
        assert!(Cli::try_parse_from(["lazywrite", "replay", "intents.jsonl"]).is_err());
    }
}
