//! Assessor CLI Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Command surface for the county assessment sync.
//!
//! - **Runs**: one-off runs (`assessor run-once`) and the recurring
//!   schedule (`assessor schedule`, `assessor disable`, `assessor status`)
//! - **File server**: browse and fetch single files (`assessor list`,
//!   `assessor download`)
//! - **Imports**: stage a local file, review it, commit it
//!   (`assessor stage`, `assessor staged`, `assessor commit`)
//!
//! Settings come from `.env` and the environment; see
//! [`assessor_sync::config`].

pub mod commands;
pub mod error;

pub use error::{CliError, Result};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Assessor - county assessment data sync
#[derive(Parser, Debug)]
#[command(name = "assessor")]
#[command(author, version, about, long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one full synchronization now
    RunOnce,

    /// Set the recurring schedule and run the scheduler in the foreground
    Schedule {
        /// Cron expression (5, 6 or 7 fields) or @hourly/@daily/@weekly/@monthly/@yearly
        expression: String,

        /// Only save the schedule; do not start the scheduler loop
        #[arg(long)]
        no_wait: bool,
    },

    /// Stop future scheduled runs
    Disable,

    /// Show scheduler, lock and last run status
    Status {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// List a remote directory
    List {
        #[arg(default_value = "/")]
        remote_path: String,
    },

    /// Download one remote file
    Download {
        remote_path: String,

        /// Target directory (defaults to SYNC_DATA_DIR)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Stage a local file for review without committing it
    Stage {
        file: PathBuf,

        /// Entity type (detected from the file name when omitted)
        #[arg(short, long)]
        entity: Option<String>,
    },

    /// Show staged imports, or the records of one import
    Staged {
        import_id: Option<String>,

        /// Only show invalid records
        #[arg(long)]
        invalid: bool,
    },

    /// Commit a staged import to the production store
    Commit { import_id: String },
}
