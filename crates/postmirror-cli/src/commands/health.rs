use postmirror_core::HybridAccessService;

use crate::commands::common::format_health_lines;
use crate::error::CliError;

pub async fn run_health(hybrid: &HybridAccessService, as_json: bool) -> Result<(), CliError> {
    let report = hybrid.health_check().await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_health_lines(&report) {
            println!("{line}");
        }
    }

    if report.healthy {
        Ok(())
    } else {
        Err(CliError::Unhealthy)
    }
}
