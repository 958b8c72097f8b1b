use postmirror_core::ConflictResolver;

use crate::commands::common::Services;
use crate::error::CliError;

pub async fn run_conflicts(services: &Services) -> Result<usize, CliError> {
    let conflicts = services.sync.detect_conflicts().await?;
    if conflicts.is_empty() {
        println!("No conflicts between source and mirror.");
        return Ok(0);
    }

    println!(
        "{}",
        ConflictResolver::new().generate_conflict_report(&conflicts)
    );
    Ok(conflicts.len())
}
