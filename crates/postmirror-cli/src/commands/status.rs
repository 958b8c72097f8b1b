use postmirror_core::models::SyncStats;
use postmirror_core::{SyncRun, TimestampTracker};
use serde::Serialize;

use crate::commands::common::{format_run_lines, format_stats_lines, Services};
use crate::error::CliError;

const STATUS_RECENT_RUNS: usize = 5;

#[derive(Debug, Serialize)]
struct StatusReport {
    stats: SyncStats,
    recent_runs: Vec<SyncRun>,
}

pub async fn run_status(services: &Services, as_json: bool) -> Result<(), CliError> {
    let report = StatusReport {
        stats: services.sync.get_sync_stats().await,
        recent_runs: services.sync.sync_history(Some(STATUS_RECENT_RUNS)).await?,
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    for line in format_stats_lines(&report.stats) {
        println!("{line}");
    }
    if !report.recent_runs.is_empty() {
        println!();
        println!("Recent runs:");
        for line in format_run_lines(&report.recent_runs) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_history(
    tracker: &TimestampTracker,
    limit: usize,
    as_json: bool,
) -> Result<(), CliError> {
    let runs = tracker.sync_history(Some(limit)).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!("No sync runs recorded.");
        return Ok(());
    }

    for line in format_run_lines(&runs) {
        println!("{line}");
    }
    Ok(())
}
