//! Relay CLI Library
//!
//! Operator command line for the relay staging store.
//!
//! # Overview
//!
//! - **Status**: entity counts and queue depths (`relay status`)
//! - **Aggregation**: aggregate queued items and close aggregates (`relay close`)
//! - **Forwarding**: reset failed forwards (`relay reset-failed`), list destinations
//!   (`relay destinations`)
//! - **Cleanup**: sweep forwarded sources (`relay sweep`), wipe the store (`relay clear`)
//! - **Maintenance**: run database maintenance (`relay maintain`)
//! - **Housekeeping loop**: everything above on a timer (`relay run`)

pub mod commands;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CliError, Result};

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use relay_repo::RepoConfig;

/// Relay - store-and-forward staging store administration
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Staging store database file
    #[arg(long, env = "RELAY_DB_PATH", global = true)]
    pub db: Option<PathBuf>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show entity counts and queue depths
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Aggregate queued items and close aggregates that are due
    Close {
        /// Close every open aggregate regardless of age or size
        #[arg(short, long)]
        all: bool,
    },

    /// Delete failed forward records so they are retried from scratch
    ResetFailed,

    /// Delete orphaned items and sources with nothing left to forward
    Sweep,

    /// Delete everything in the store
    Clear {
        /// Skip confirmation
        #[arg(short, long)]
        yes: bool,
    },

    /// Run database maintenance now
    Maintain,

    /// List registered forward destinations
    Destinations,

    /// Run housekeeping on a timer until interrupted
    Run {
        /// Seconds between passes
        #[arg(short, long, default_value_t = 10)]
        interval: u64,

        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
    },
}

/// Load store configuration, applying the `--db` override.
///
/// One-shot commands pass `background = false` so no maintenance thread is
/// started.
pub fn load_config(cli: &Cli, background: bool) -> Result<RepoConfig> {
    let mut config = RepoConfig::load()?;
    if let Some(ref path) = cli.db {
        config.database.path = path.clone();
    }
    if !background {
        config.database.maintenance_interval_secs = None;
    }
    Ok(config)
}
