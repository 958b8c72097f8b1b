use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "postmirror")]
#[command(about = "Operate the Postmirror sync engine from the command line")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to the local mirror database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Copy records from the source into the mirror
    Sync {
        #[command(subcommand)]
        target: SyncTarget,
    },
    /// Clear the mirror and rewrite it from the source
    Migrate,
    /// Show sync statistics and the latest runs
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recorded sync runs, newest first
    History {
        /// Number of runs to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Compare source and mirror and print a conflict report
    Conflicts,
    /// Check the mirror and the source
    Health {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete sync runs older than the given number of days
    Cleanup {
        #[arg(long, default_value = "30")]
        days: u32,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum SyncTarget {
    /// Every source record
    Full,
    /// Records changed since the last successful run
    Incremental,
    /// Changed records, resolving field-level conflicts with the mirror
    Checked,
    /// Only the given record ids
    Specific {
        /// Source record ids
        ids: Vec<String>,
    },
}
