use std::sync::Arc;
use std::time::Duration;

use postmirror_core::{Error, SyncService};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Run an incremental sync every `interval` until the task is aborted.
///
/// The first run happens one interval after start. A tick that finds
/// another run in progress is skipped.
pub fn spawn(sync: Arc<SyncService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match sync.incremental_sync().await {
                Ok(batch) => tracing::info!(
                    batch_id = %batch.id,
                    success = batch.success,
                    failed = batch.failed,
                    "Scheduled incremental sync finished"
                ),
                Err(Error::SyncInProgress) => {
                    tracing::debug!("Sync already running; skipping scheduled tick");
                }
                Err(error) => tracing::warn!(%error, "Scheduled incremental sync failed"),
            }
        }
    })
}
