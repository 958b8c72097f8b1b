use postmirror_core::TimestampTracker;

use crate::error::CliError;

pub async fn run_cleanup(tracker: &TimestampTracker, days: u32) -> Result<u64, CliError> {
    let removed = tracker.cleanup_old_timestamps(days).await?;
    println!("Removed {removed} sync runs older than {days} days");
    Ok(removed)
}
