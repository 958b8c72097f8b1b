//! Durable bookkeeping of sync runs

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{MirrorRecord, RunKind, RunStatus, SyncDirection, SyncRun};
use crate::store::{MirrorFilter, MirrorOrder, MirrorQuery, MirrorStore, SyncRunStore};

/// Records run start/completion and answers "what changed since when".
///
/// Runs are persisted through a [`SyncRunStore`], so the last sync time
/// survives restarts and is shared by every instance on the same mirror.
#[derive(Clone)]
pub struct TimestampTracker {
    runs: Arc<dyn SyncRunStore>,
    mirror: Arc<dyn MirrorStore>,
}

impl TimestampTracker {
    pub fn new(runs: Arc<dyn SyncRunStore>, mirror: Arc<dyn MirrorStore>) -> Self {
        Self { runs, mirror }
    }

    pub async fn record_sync_start(&self, kind: RunKind, direction: SyncDirection) -> Result<Uuid> {
        let run = SyncRun::start(kind, direction);
        self.runs.save_run(&run).await?;
        tracing::debug!(run_id = %run.id, kind = %kind, "Sync run started");
        Ok(run.id)
    }

    pub async fn record_sync_complete(
        &self,
        run_id: Uuid,
        records_synced: u64,
        success: bool,
        error: Option<String>,
    ) -> Result<SyncRun> {
        let mut run = self
            .runs
            .get_run(run_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("sync run {run_id}")))?;
        run.finish(records_synced, success, error);
        self.runs.save_run(&run).await?;
        tracing::debug!(
            run_id = %run.id,
            records_synced,
            success,
            "Sync run finished"
        );
        Ok(run)
    }

    /// Completion (or start) time of the newest successful run, optionally of one kind
    pub async fn get_last_sync_time(&self, kind: Option<RunKind>) -> Result<Option<DateTime<Utc>>> {
        let runs = self.runs.list_runs(None).await?;
        Ok(runs
            .iter()
            .filter(|run| run.status == RunStatus::Completed)
            .filter(|run| kind.is_none_or(|kind| run.kind == kind))
            .map(SyncRun::effective_time)
            .max())
    }

    /// Mirror rows updated strictly after `since`, newest first
    pub async fn get_modified_since(&self, since: DateTime<Utc>) -> Result<Vec<MirrorRecord>> {
        self.mirror
            .query(
                &MirrorQuery::new(MirrorFilter::UpdatedAfter(since))
                    .order(MirrorOrder::UpdatedAtDesc),
            )
            .await
    }

    /// Drop runs started more than `days` ago; returns how many were removed
    pub async fn cleanup_old_timestamps(&self, days: u32) -> Result<u64> {
        let cutoff = Utc::now() - TimeDelta::days(i64::from(days));
        let removed = self.runs.delete_runs_before(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, days, "Removed old sync runs");
        }
        Ok(removed)
    }

    /// Newest first
    pub async fn sync_history(&self, limit: Option<usize>) -> Result<Vec<SyncRun>> {
        self.runs.list_runs(limit).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{MirrorDraft, MirrorStatus};
    use crate::store::MemoryMirrorStore;

    fn tracker() -> (TimestampTracker, MemoryMirrorStore) {
        let store = MemoryMirrorStore::new();
        let tracker = TimestampTracker::new(Arc::new(store.clone()), Arc::new(store.clone()));
        (tracker, store)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_sync_time_is_none_without_completed_runs() {
        let (tracker, _) = tracker();
        assert_eq!(tracker.get_last_sync_time(None).await.unwrap(), None);

        tracker
            .record_sync_start(RunKind::Full, SyncDirection::SourceToMirror)
            .await
            .unwrap();
        assert_eq!(tracker.get_last_sync_time(None).await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_sync_time_tracks_completed_runs_by_kind() {
        let (tracker, _) = tracker();
        let full = tracker
            .record_sync_start(RunKind::Full, SyncDirection::SourceToMirror)
            .await
            .unwrap();
        let full_run = tracker
            .record_sync_complete(full, 3, true, None)
            .await
            .unwrap();

        let failed = tracker
            .record_sync_start(RunKind::Incremental, SyncDirection::SourceToMirror)
            .await
            .unwrap();
        tracker
            .record_sync_complete(failed, 0, false, Some("boom".to_string()))
            .await
            .unwrap();

        assert_eq!(
            tracker.get_last_sync_time(None).await.unwrap(),
            full_run.completed_at
        );
        assert_eq!(
            tracker
                .get_last_sync_time(Some(RunKind::Incremental))
                .await
                .unwrap(),
            None
        );

        let history = tracker.sync_history(Some(10)).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, failed);
        assert_eq!(history[0].error.as_deref(), Some("boom"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn completing_unknown_run_is_not_found() {
        let (tracker, _) = tracker();
        let err = tracker
            .record_sync_complete(Uuid::now_v7(), 0, true, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn modified_since_reads_mirror_rows() {
        let (tracker, store) = tracker();
        let now = Utc::now();
        for (id, age_hours) in [("old", 48), ("new", 1)] {
            let updated_at = now - TimeDelta::hours(age_hours);
            store
                .insert(&MirrorDraft {
                    external_id: id.to_string(),
                    title: id.to_string(),
                    slug: id.to_string(),
                    content: None,
                    status: MirrorStatus::Published,
                    published_at: Some(updated_at),
                    created_at: updated_at,
                    updated_at,
                    tags: BTreeSet::new(),
                    category: None,
                    summary: None,
                    cover_image: None,
                })
                .await
                .unwrap();
        }

        let rows = tracker
            .get_modified_since(now - TimeDelta::hours(24))
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|row| row.external_id.as_str()).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn cleanup_drops_only_old_runs() {
        let (tracker, store) = tracker();
        let mut old = SyncRun::start(RunKind::Full, SyncDirection::SourceToMirror);
        old.started_at = Utc::now() - TimeDelta::days(40);
        store.save_run(&old).await.unwrap();
        tracker
            .record_sync_start(RunKind::Manual, SyncDirection::SourceToMirror)
            .await
            .unwrap();

        assert_eq!(tracker.cleanup_old_timestamps(30).await.unwrap(), 1);
        assert_eq!(tracker.sync_history(None).await.unwrap().len(), 1);
    }
}
