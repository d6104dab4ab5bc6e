//! Argument parsing.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use url::Url;

/// Application cache maintenance tool.
#[derive(Debug, Parser)]
#[command(name = "appcache", version, about)]
pub struct Cli {
    /// Directory of the on-disk store. An in-memory store is used when
    /// omitted, so nothing outlives the process.
    #[arg(short, long, global = true)]
    pub store: Option<PathBuf>,

    /// JSON file with update settings.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the retry ceiling for `503` responses.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Overrides the number of resource fetches in flight.
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Increases log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// What to do.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Downloads or updates the cache of a manifest.
    Update {
        /// Manifest URL.
        manifest: Url,
        /// Document to record as a master entry.
        #[arg(short, long)]
        master: Option<Url>,
    },
    /// Lists stored groups.
    List,
    /// Deletes the group of a manifest.
    Delete {
        /// Manifest URL.
        manifest: Url,
    },
    /// Shows which cached response would serve a navigation.
    Lookup {
        /// Document URL.
        url: Url,
    },
}

impl Cli {
    /// Log filter implied by `-v` when `RUST_LOG` is unset.
    pub fn default_log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }
}
