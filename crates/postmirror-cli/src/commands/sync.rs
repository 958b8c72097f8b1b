use postmirror_core::SyncBatch;

use crate::cli::SyncTarget;
use crate::commands::common::{format_batch_lines, Services};
use crate::error::CliError;

pub async fn run_sync(services: &Services, target: &SyncTarget) -> Result<SyncBatch, CliError> {
    let batch = match target {
        SyncTarget::Full => services.sync.sync_all(None).await?,
        SyncTarget::Incremental => services.sync.incremental_sync().await?,
        SyncTarget::Checked => services.sync.incremental_with_conflicts().await?,
        SyncTarget::Specific { ids } => {
            let ids: Vec<String> = ids
                .iter()
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .collect();
            if ids.is_empty() {
                return Err(CliError::MissingIds);
            }
            services.sync.sync_all(Some(&ids)).await?
        }
    };

    for line in format_batch_lines(&batch) {
        println!("{line}");
    }
    Ok(batch)
}

pub async fn run_migrate(services: &Services) -> Result<SyncBatch, CliError> {
    let batch = services.sync.initial_migration().await?;
    for line in format_batch_lines(&batch) {
        println!("{line}");
    }
    Ok(batch)
}
