//! Write path: sync runs from the source into the mirror.
//!
//! Every entry point that writes takes the same run lock, so a full sync, an
//! incremental sync and a webhook-triggered sync never race on mirror rows.
//! Contention is reported immediately as [`Error::SyncInProgress`].

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use uuid::Uuid;

use crate::batch::{empty_batch, BatchOptions, BatchProcessor, ConflictCheck};
use crate::classify::Origin;
use crate::config::{RuntimeConfig, RuntimeConfigPatch, SharedConfig};
use crate::conflict::ConflictResolver;
use crate::error::{Error, Result};
use crate::hybrid::HybridAccessService;
use crate::models::{
    Record, ResolutionStrategy, RunKind, RunStatus, SyncBatch, SyncConflict, SyncDirection,
    SyncProgress, SyncRun, SyncStats, WebhookEvent, WebhookPayload,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::source::SourceClient;
use crate::store::{MirrorFilter, MirrorOrder, MirrorQuery, MirrorStore, SyncRunStore};
use crate::tracker::TimestampTracker;
use crate::util::sanitize;

/// Completed batches kept for the status surface
pub const RECENT_BATCH_LIMIT: usize = 20;

/// Hooks into the sync lifecycle. Every method defaults to a no-op.
pub trait SyncObserver: Send + Sync {
    fn on_sync_start(&self, _batch: &SyncBatch) {}

    fn on_sync_progress(&self, _progress: &SyncProgress) {}

    fn on_sync_complete(&self, _batch: &SyncBatch) {}

    fn on_sync_error(&self, _error: &Error) {}

    /// Return a strategy to override the conflict's own resolution
    fn on_conflict(&self, _conflict: &SyncConflict) -> Option<ResolutionStrategy> {
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl SyncObserver for NoopObserver {}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Synced { batch: SyncBatch },
    Deleted { removed: u64 },
}

pub struct SyncService {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn MirrorStore>,
    tracker: TimestampTracker,
    resolver: ConflictResolver,
    batches: BatchProcessor,
    config: SharedConfig,
    observer: Arc<dyn SyncObserver>,
    hybrid: Option<Arc<HybridAccessService>>,
    run_lock: AsyncMutex<()>,
    running: AtomicBool,
    recent: Mutex<VecDeque<SyncBatch>>,
}

/// Held for the duration of a run
struct RunGuard<'a> {
    _lock: MutexGuard<'a, ()>,
    running: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

impl SyncService {
    /// `store` must be the service-role handle; `runs` persists run bookkeeping
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn MirrorStore>,
        runs: Arc<dyn SyncRunStore>,
        config: SharedConfig,
    ) -> Self {
        let observer: Arc<dyn SyncObserver> = Arc::new(NoopObserver);
        Self {
            tracker: TimestampTracker::new(runs, Arc::clone(&store)),
            batches: BatchProcessor::new(
                Arc::clone(&source),
                Arc::clone(&store),
                config.clone(),
                Arc::clone(&observer),
            ),
            source,
            store,
            resolver: ConflictResolver::new(),
            config,
            observer,
            hybrid: None,
            run_lock: AsyncMutex::new(()),
            running: AtomicBool::new(false),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_BATCH_LIMIT)),
        }
    }

    #[must_use]
    pub fn with_observer(mut self, observer: Arc<dyn SyncObserver>) -> Self {
        self.batches = BatchProcessor::new(
            Arc::clone(&self.source),
            Arc::clone(&self.store),
            self.config.clone(),
            Arc::clone(&observer),
        );
        self.observer = observer;
        self
    }

    /// Invalidate this read service's cache after webhook-driven changes
    #[must_use]
    pub fn with_hybrid(mut self, hybrid: Arc<HybridAccessService>) -> Self {
        self.hybrid = Some(hybrid);
        self
    }

    pub const fn tracker(&self) -> &TimestampTracker {
        &self.tracker
    }

    /// Sync every source record, or only `ids` when given.
    ///
    /// Existing rows go through the coarse conflict check (mirror newer than
    /// source) and the configured default resolution.
    pub async fn sync_all(&self, ids: Option<&[String]>) -> Result<SyncBatch> {
        let _guard = self.acquire()?;
        let kind = if ids.is_some() {
            RunKind::Manual
        } else {
            RunKind::Full
        };
        self.tracked(kind, SyncDirection::SourceToMirror, |run_id| {
            self.sync_records(run_id, kind, ids)
        })
        .await
    }

    /// Sync only records changed since the last successful run
    pub async fn incremental_sync(&self) -> Result<SyncBatch> {
        let _guard = self.acquire()?;
        self.tracked(RunKind::Incremental, SyncDirection::SourceToMirror, |run_id| {
            self.sync_changed(run_id)
        })
        .await
    }

    /// Full sync in `direction`; the source is the only authority, so
    /// mirror-to-source always fails without touching anything
    pub async fn bulk_sync(&self, direction: SyncDirection) -> Result<SyncBatch> {
        if direction == SyncDirection::MirrorToSource {
            return Err(Error::UnsupportedDirection(direction));
        }
        if direction == SyncDirection::Bidirectional {
            tracing::warn!("Bidirectional sync requested; only source-to-mirror will run");
        }
        let _guard = self.acquire()?;
        self.tracked(RunKind::Full, direction, |run_id| {
            self.sync_records(run_id, RunKind::Full, None)
        })
        .await
    }

    /// Clear the mirror and rewrite it from the source
    pub async fn initial_migration(&self) -> Result<SyncBatch> {
        let _guard = self.acquire()?;
        self.tracked(RunKind::Full, SyncDirection::SourceToMirror, |run_id| {
            self.batches.initial_migration(run_id)
        })
        .await
    }

    /// Incremental sync using full conflict analysis with smaller chunks
    pub async fn incremental_with_conflicts(&self) -> Result<SyncBatch> {
        let _guard = self.acquire()?;
        let work = |run_id: Uuid| async move {
            let since = self.last_sync_marker().await?;
            self.batches.incremental_with_conflicts(run_id, since).await
        };
        self.tracked(RunKind::Incremental, SyncDirection::SourceToMirror, work)
            .await
    }

    /// Apply resolutions to conflicts found earlier
    pub async fn resolve_conflicts(
        &self,
        conflicts: &[SyncConflict],
        strategy: Option<ResolutionStrategy>,
    ) -> Result<SyncBatch> {
        let _guard = self.acquire()?;
        let work = |run_id: Uuid| async move {
            Ok(self
                .batches
                .apply_resolutions(run_id, conflicts, strategy)
                .await)
        };
        self.tracked(RunKind::Manual, SyncDirection::SourceToMirror, work)
            .await
    }

    /// Compare every source record against its mirror row
    pub async fn detect_conflicts(&self) -> Result<Vec<SyncConflict>> {
        let config = self.config.snapshot();
        let sources = self.fetch_source(&config).await?;
        let mirrors = self.store.query(&MirrorQuery::all()).await?;
        Ok(self.resolver.detect_conflicts(&sources, &mirrors))
    }

    pub async fn conflict_report(&self) -> Result<String> {
        let conflicts = self.detect_conflicts().await?;
        Ok(self.resolver.generate_conflict_report(&conflicts))
    }

    /// Best-effort counters; collection failures land in `errors`
    pub async fn get_sync_stats(&self) -> SyncStats {
        let mut stats = SyncStats::default();

        match self.source.list_all().await {
            Ok(records) => stats.total_records = records.len(),
            Err(error) => stats.errors.push(format!("source: {}", sanitize(&error))),
        }
        match self.store.count(&MirrorFilter::All).await {
            Ok(count) => stats.synced_records = count,
            Err(error) => stats.errors.push(format!("mirror: {}", sanitize(&error))),
        }
        match self.tracker.get_last_sync_time(None).await {
            Ok(time) => stats.last_sync_time = time,
            Err(error) => stats.errors.push(format!("tracker: {}", sanitize(&error))),
        }

        stats.pending_records = stats.total_records.saturating_sub(stats.synced_records);
        if let Some(last) = self.recent.lock().front() {
            stats.failed_records = last.failed;
            stats.errors.extend(last.errors.iter().cloned());
        }
        stats
    }

    pub async fn sync_history(&self, limit: Option<usize>) -> Result<Vec<SyncRun>> {
        self.tracker.sync_history(limit).await
    }

    /// Newest first
    pub fn recent_batches(&self) -> Vec<SyncBatch> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn progress(&self, batch_id: Uuid) -> Option<SyncProgress> {
        self.batches.progress(batch_id)
    }

    pub fn active_progress(&self) -> Vec<SyncProgress> {
        self.batches.active_progress()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Merge `patch` into the live configuration
    pub fn update_config(&self, patch: &RuntimeConfigPatch) -> Result<RuntimeConfig> {
        self.config.update(patch)
    }

    pub fn config(&self) -> RuntimeConfig {
        self.config.snapshot()
    }

    pub async fn cleanup(&self, days: u32) -> Result<u64> {
        self.tracker.cleanup_old_timestamps(days).await
    }

    /// Created/updated events sync the one record; deleted events remove its row
    pub async fn handle_webhook(&self, payload: &WebhookPayload) -> Result<WebhookOutcome> {
        let external_id = payload.external_id.trim();
        if external_id.is_empty() {
            return Err(Error::InvalidInput(
                "webhook payload is missing external_id".to_string(),
            ));
        }
        tracing::info!(event = %payload.event, external_id, "Handling webhook");

        match payload.event {
            WebhookEvent::Created | WebhookEvent::Updated => {
                let batch = self.sync_all(Some(&[external_id.to_string()])).await?;
                let slug = self
                    .store
                    .find_by_external_id(external_id)
                    .await
                    .ok()
                    .flatten()
                    .map(|row| row.slug);
                self.invalidate(external_id, slug.as_deref());
                Ok(WebhookOutcome::Synced { batch })
            }
            WebhookEvent::Deleted => {
                let _guard = self.acquire()?;
                let existing = self.store.find_by_external_id(external_id).await?;
                let removed = self
                    .store
                    .delete_by_filter(&MirrorFilter::ExternalId(external_id.to_string()))
                    .await?;
                self.invalidate(external_id, existing.as_ref().map(|row| row.slug.as_str()));
                tracing::info!(external_id, removed, "Removed mirror row");
                Ok(WebhookOutcome::Deleted { removed })
            }
        }
    }

    fn acquire(&self) -> Result<RunGuard<'_>> {
        let lock = self.run_lock.try_lock().map_err(|_| Error::SyncInProgress)?;
        self.running.store(true, Ordering::SeqCst);
        Ok(RunGuard {
            _lock: lock,
            running: &self.running,
        })
    }

    fn invalidate(&self, external_id: &str, slug: Option<&str>) {
        if let Some(hybrid) = &self.hybrid {
            hybrid.invalidate_record(external_id, slug);
        }
    }

    /// Bracket `work` with run bookkeeping and remember the resulting batch.
    ///
    /// The batch carries the run id. A run that left failed records behind
    /// is recorded as failed so it never advances the incremental marker.
    async fn tracked<F, Fut>(
        &self,
        kind: RunKind,
        direction: SyncDirection,
        work: F,
    ) -> Result<SyncBatch>
    where
        F: FnOnce(Uuid) -> Fut,
        Fut: Future<Output = Result<SyncBatch>>,
    {
        let run_id = self.tracker.record_sync_start(kind, direction).await?;
        match work(run_id).await {
            Ok(batch) => {
                let error = (batch.failed > 0)
                    .then(|| format!("{} of {} records failed", batch.failed, batch.total));
                let synced = u64::try_from(batch.success).unwrap_or(u64::MAX);
                self.tracker
                    .record_sync_complete(run_id, synced, error.is_none(), error)
                    .await?;
                self.remember(batch.clone());
                Ok(batch)
            }
            Err(error) => {
                let message = sanitize(&error);
                tracing::error!(run_id = %run_id, kind = %kind, error = %message, "Sync run failed");
                if let Err(track_error) = self
                    .tracker
                    .record_sync_complete(run_id, 0, false, Some(message.clone()))
                    .await
                {
                    tracing::warn!(run_id = %run_id, error = %track_error, "Failed to record run failure");
                }
                self.observer.on_sync_error(&error);
                let mut batch = SyncBatch::new(run_id, kind, 0);
                batch.abort(message);
                self.remember(batch);
                Err(error)
            }
        }
    }

    async fn sync_records(
        &self,
        run_id: Uuid,
        kind: RunKind,
        ids: Option<&[String]>,
    ) -> Result<SyncBatch> {
        let config = self.config.snapshot();
        let mut records = self.fetch_source(&config).await?;
        let mut missing = Vec::new();
        if let Some(ids) = ids {
            let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
            records.retain(|record| wanted.contains(record.id.as_str()));
            let found: HashSet<&str> = records.iter().map(|record| record.id.as_str()).collect();
            missing = ids
                .iter()
                .filter(|id| !found.contains(id.as_str()))
                .cloned()
                .collect();
        }

        let options = BatchOptions::from_config(&config, ConflictCheck::Coarse);
        let mut batch = self.batches.run(run_id, kind, records, &options).await;
        for id in missing {
            batch.push_warning(format!("{id}: not present in source"));
        }
        Ok(batch)
    }

    async fn sync_changed(&self, run_id: Uuid) -> Result<SyncBatch> {
        let config = self.config.snapshot();
        let since = self.last_sync_marker().await?;
        let mut records = self.fetch_source(&config).await?;
        if let Some(since) = since {
            records.retain(|record| record.modified_after(since));
        }
        tracing::info!(
            since = ?since,
            changed = records.len(),
            "Incremental sync selected records"
        );

        let options = BatchOptions::from_config(&config, ConflictCheck::Coarse);
        if records.is_empty() {
            return Ok(empty_batch(run_id, RunKind::Incremental));
        }
        Ok(self
            .batches
            .run(run_id, RunKind::Incremental, records, &options)
            .await)
    }

    /// Last successful run, or the newest mirror row when no run is recorded
    async fn last_sync_marker(&self) -> Result<Option<DateTime<Utc>>> {
        if let Some(time) = self.tracker.get_last_sync_time(None).await? {
            return Ok(Some(time));
        }
        // Rows written by a failed run would hide the records it missed
        let history = self.tracker.sync_history(None).await?;
        if history.iter().any(|run| run.status == RunStatus::Failed) {
            return Ok(None);
        }
        let newest = self
            .store
            .query(&MirrorQuery::all().order(MirrorOrder::UpdatedAtDesc).limit(1))
            .await?;
        Ok(newest.first().map(|row| row.updated_at))
    }

    async fn fetch_source(&self, config: &RuntimeConfig) -> Result<Vec<Record>> {
        let policy = RetryPolicy::from_config(config);
        with_retry(&policy, Origin::Source, "list source records", move || {
            self.source.list_all()
        })
        .await
        .map_err(Error::Classified)
    }

    fn remember(&self, batch: SyncBatch) {
        let mut recent = self.recent.lock();
        recent.push_front(batch);
        recent.truncate(RECENT_BATCH_LIMIT);
    }
}
