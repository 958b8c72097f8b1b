//! Postmirror CLI - operator commands for the sync engine
//!
//! Runs syncs, migrations and maintenance against the same mirror database
//! the API serves from.

mod cli;
mod commands;
mod error;

use clap::Parser;

use crate::cli::{Cli, Commands};
use crate::commands::cleanup::run_cleanup;
use crate::commands::common::{open_tracker, resolve_db_path, CliEnv, Services};
use crate::commands::conflicts::run_conflicts;
use crate::commands::health::run_health;
use crate::commands::status::{run_history, run_status};
use crate::commands::sync::{run_migrate, run_sync};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("postmirror=info".parse().expect("valid directive"))
                .add_directive("postmirror_core=info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let env = CliEnv::from_env()?;
    let db_path = resolve_db_path(cli.db_path, &env);

    match cli.command {
        Commands::Sync { target } => {
            let services = Services::open(&db_path, &env).await?;
            run_sync(&services, &target).await?;
        }
        Commands::Migrate => {
            let services = Services::open(&db_path, &env).await?;
            run_migrate(&services).await?;
        }
        Commands::Status { json } => {
            let services = Services::open(&db_path, &env).await?;
            run_status(&services, json).await?;
        }
        Commands::History { limit, json } => {
            let tracker = open_tracker(&db_path, &env).await?;
            run_history(&tracker, limit, json).await?;
        }
        Commands::Conflicts => {
            let services = Services::open(&db_path, &env).await?;
            run_conflicts(&services).await?;
        }
        Commands::Health { json } => {
            let services = Services::open(&db_path, &env).await?;
            run_health(&services.hybrid, json).await?;
        }
        Commands::Cleanup { days } => {
            let tracker = open_tracker(&db_path, &env).await?;
            run_cleanup(&tracker, days).await?;
        }
    }

    Ok(())
}
