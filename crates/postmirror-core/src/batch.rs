//! Chunked, bounded-concurrency writes into the mirror.
//!
//! Every mode shares [`BatchProcessor::run`]: records are split into chunks,
//! each chunk fans out to at most `max_concurrency` in-flight record writes,
//! and chunks are separated by a fixed delay. A failing record never cancels
//! its siblings; it is counted on the batch and the run carries on.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::classify::{backoff_delay, classify, Origin};
use crate::config::{RuntimeConfig, SharedConfig};
use crate::conflict::{coarse_conflict, ConflictResolver};
use crate::error::{Error, Result};
use crate::models::{
    MirrorDraft, OperationKind, Record, ResolutionStrategy, RunKind, SyncBatch, SyncConflict,
    SyncOperation, SyncProgress,
};
use crate::retry::{with_retry, RetryPolicy};
use crate::source::SourceClient;
use crate::store::{MirrorFilter, MirrorStore};
use crate::sync::SyncObserver;
use crate::util::duration_millis;

/// Finished progress entries kept around for status queries
const PROGRESS_RETENTION: usize = 20;
/// Upper bound on chunk size in conflict-aware mode
const CONFLICT_CHUNK_LIMIT: usize = 5;

/// Which conflict detector runs before updating an existing row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCheck {
    /// Overwrite unconditionally
    None,
    /// Mirror row newer than the source record
    Coarse,
    /// Multi-signal analysis with recommended resolution
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub chunk_size: usize,
    pub max_concurrency: usize,
    pub delay_between_chunks: Duration,
    pub conflicts: ConflictCheck,
    /// Resolution applied to coarse conflicts
    pub strategy: ResolutionStrategy,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub max_retry_delay: Duration,
    /// Skip the existence lookup; used after the mirror was cleared
    pub insert_only: bool,
}

impl BatchOptions {
    pub fn from_config(config: &RuntimeConfig, conflicts: ConflictCheck) -> Self {
        Self {
            chunk_size: config.batch_size.max(1),
            max_concurrency: config.max_concurrency.max(1),
            delay_between_chunks: config.delay_between_batches(),
            conflicts,
            strategy: config.conflict_resolution,
            max_retries: config.max_retries,
            retry_base_delay: config.retry_base_delay(),
            max_retry_delay: config.max_retry_delay(),
            insert_only: false,
        }
    }

    /// Smaller chunks and half the pause, with full conflict analysis
    pub fn conflict_aware(config: &RuntimeConfig) -> Self {
        let mut options = Self::from_config(config, ConflictCheck::Full);
        options.chunk_size = options.chunk_size.min(CONFLICT_CHUNK_LIMIT);
        options.delay_between_chunks /= 2;
        options
    }
}

struct RecordOutcome {
    operation: SyncOperation,
    warnings: Vec<String>,
}

/// What a successful attempt did to the mirror
struct Applied {
    kind: OperationKind,
    mirror_id: Option<Uuid>,
    skipped: bool,
    warnings: Vec<String>,
}

impl Applied {
    const fn written(kind: OperationKind, mirror_id: Uuid) -> Self {
        Self {
            kind,
            mirror_id: Some(mirror_id),
            skipped: false,
            warnings: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub struct BatchProcessor {
    source: Arc<dyn SourceClient>,
    store: Arc<dyn MirrorStore>,
    resolver: ConflictResolver,
    config: SharedConfig,
    observer: Arc<dyn SyncObserver>,
    progress: Arc<RwLock<HashMap<Uuid, SyncProgress>>>,
}

impl BatchProcessor {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn MirrorStore>,
        config: SharedConfig,
        observer: Arc<dyn SyncObserver>,
    ) -> Self {
        Self {
            source,
            store,
            resolver: ConflictResolver::new(),
            config,
            observer,
            progress: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Clear the mirror and rewrite every source record without conflict checks
    pub async fn initial_migration(&self, batch_id: Uuid) -> Result<SyncBatch> {
        let config = self.config.snapshot();
        let records = self.fetch_source(&config).await?;
        if records.is_empty() {
            tracing::info!("Source is empty, nothing to migrate");
            return Ok(empty_batch(batch_id, RunKind::Full));
        }

        let removed = self.store.delete_by_filter(&MirrorFilter::All).await?;
        tracing::info!(removed, total = records.len(), "Cleared mirror for initial migration");

        let mut options = BatchOptions::from_config(&config, ConflictCheck::None);
        options.insert_only = true;
        Ok(self.run(batch_id, RunKind::Full, records, &options).await)
    }

    /// Sync records changed after `since` (all when `None`) with full conflict analysis
    pub async fn incremental_with_conflicts(
        &self,
        batch_id: Uuid,
        since: Option<DateTime<Utc>>,
    ) -> Result<SyncBatch> {
        let config = self.config.snapshot();
        let mut records = self.fetch_source(&config).await?;
        if let Some(since) = since {
            records.retain(|record| record.modified_after(since));
        }
        if records.is_empty() {
            return Ok(empty_batch(batch_id, RunKind::Incremental));
        }
        Ok(self
            .run(
                batch_id,
                RunKind::Incremental,
                records,
                &BatchOptions::conflict_aware(&config),
            )
            .await)
    }

    /// Core loop shared by every sync mode; `batch_id` keys progress lookups
    pub async fn run(
        &self,
        batch_id: Uuid,
        kind: RunKind,
        records: Vec<Record>,
        options: &BatchOptions,
    ) -> SyncBatch {
        let chunk_size = options.chunk_size.max(1);
        let total_chunks = records.len().div_ceil(chunk_size);

        let mut batch = SyncBatch::new(batch_id, kind, records.len());
        batch.start();
        self.track(SyncProgress::new(batch_id, records.len(), total_chunks));
        self.observer.on_sync_start(&batch);
        tracing::info!(
            run_id = %batch_id,
            kind = %kind,
            total = records.len(),
            total_chunks,
            "Batch started"
        );

        for (index, chunk) in records.chunks(chunk_size).enumerate() {
            self.update_progress(batch_id, |progress| progress.current_chunk = index + 1);

            let mut outcomes = stream::iter(chunk.to_vec())
                .map(|record| {
                    let processor = self.clone();
                    let options = options.clone();
                    async move { processor.sync_record(&record, &options).await }
                })
                .buffer_unordered(options.max_concurrency.max(1));
            while let Some(outcome) = outcomes.next().await {
                let status = outcome.operation.status;
                for warning in outcome.warnings {
                    batch.push_warning(format!("{}: {warning}", outcome.operation.external_id));
                }
                batch.record(outcome.operation);
                if let Some(progress) =
                    self.update_progress(batch_id, |progress| progress.record(status, Utc::now()))
                {
                    self.observer.on_sync_progress(&progress);
                }
            }

            if index + 1 < total_chunks && !options.delay_between_chunks.is_zero() {
                tokio::time::sleep(options.delay_between_chunks).await;
            }
        }

        batch.finish();
        self.update_progress(batch_id, |progress| progress.finished = true);
        self.observer.on_sync_complete(&batch);
        tracing::info!(
            run_id = %batch_id,
            success = batch.success,
            failed = batch.failed,
            skipped = batch.skipped,
            "Batch finished"
        );
        batch
    }

    /// Write already-detected conflicts one at a time, with `strategy`
    /// overriding each conflict's own resolution when given
    pub async fn apply_resolutions(
        &self,
        batch_id: Uuid,
        conflicts: &[SyncConflict],
        strategy: Option<ResolutionStrategy>,
    ) -> SyncBatch {
        let max_retries = self.config.snapshot().max_retries;
        let mut batch = SyncBatch::new(batch_id, RunKind::Manual, conflicts.len());
        batch.start();
        for conflict in conflicts {
            let mut operation = SyncOperation::new(
                OperationKind::Update,
                conflict.source.id.clone(),
                max_retries,
            );
            operation.start();
            match self
                .apply_conflict(conflict, strategy.unwrap_or(conflict.resolution))
                .await
            {
                Ok(applied) => {
                    operation.mirror_id = applied.mirror_id;
                    for warning in applied.warnings {
                        batch.push_warning(format!("{}: {warning}", conflict.source.id));
                    }
                    if applied.skipped {
                        operation.skip();
                    } else {
                        operation.complete();
                    }
                }
                Err(error) => operation.fail(classify(&error, Origin::Mirror).message),
            }
            batch.record(operation);
        }
        batch.finish();
        batch
    }

    pub fn progress(&self, run_id: Uuid) -> Option<SyncProgress> {
        self.progress.read().get(&run_id).cloned()
    }

    /// Runs that have not finished yet
    pub fn active_progress(&self) -> Vec<SyncProgress> {
        let mut active: Vec<SyncProgress> = self
            .progress
            .read()
            .values()
            .filter(|progress| !progress.finished)
            .cloned()
            .collect();
        active.sort_by_key(|progress| progress.started_at);
        active
    }

    async fn fetch_source(&self, config: &RuntimeConfig) -> Result<Vec<Record>> {
        let policy = RetryPolicy::from_config(config);
        with_retry(&policy, Origin::Source, "list source records", move || {
            self.source.list_all()
        })
        .await
        .map_err(Error::Classified)
    }

    async fn sync_record(&self, record: &Record, options: &BatchOptions) -> RecordOutcome {
        let mut operation =
            SyncOperation::new(OperationKind::Create, record.id.clone(), options.max_retries);
        operation.start();

        loop {
            match self.apply(record, options).await {
                Ok(applied) => {
                    operation.kind = applied.kind;
                    operation.mirror_id = applied.mirror_id;
                    if applied.skipped {
                        operation.skip();
                    } else {
                        operation.complete();
                    }
                    return RecordOutcome {
                        operation,
                        warnings: applied.warnings,
                    };
                }
                Err(error) => {
                    let classified = classify(&error, Origin::Mirror);
                    if !classified.retryable || !operation.can_retry() {
                        tracing::warn!(
                            external_id = %record.id,
                            attempt = operation.retry_count + 1,
                            error = %classified,
                            "Record sync failed"
                        );
                        operation.fail(classified.message);
                        return RecordOutcome {
                            operation,
                            warnings: Vec::new(),
                        };
                    }
                    let delay = backoff_delay(
                        operation.retry_count + 1,
                        options.retry_base_delay,
                        options.max_retry_delay,
                        Some(&classified),
                    );
                    tracing::debug!(
                        external_id = %record.id,
                        attempt = operation.retry_count + 1,
                        delay_ms = duration_millis(delay),
                        error = %classified,
                        "Retrying record sync"
                    );
                    operation.retry(classified.message);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn apply(&self, record: &Record, options: &BatchOptions) -> Result<Applied> {
        let draft = MirrorDraft::from_record(record);
        if options.insert_only {
            let row = self.store.insert(&draft).await?;
            return Ok(Applied::written(OperationKind::Create, row.id));
        }

        let Some(existing) = self.store.find_by_external_id(&record.id).await? else {
            let row = self.store.insert(&draft).await?;
            return Ok(Applied::written(OperationKind::Create, row.id));
        };

        let conflict = match options.conflicts {
            ConflictCheck::None => None,
            ConflictCheck::Coarse => coarse_conflict(record, &existing, options.strategy),
            ConflictCheck::Full => self.resolver.check(record, &existing),
        };
        let Some(conflict) = conflict else {
            self.update(record, &draft).await?;
            return Ok(Applied::written(OperationKind::Update, existing.id));
        };

        let strategy = self
            .observer
            .on_conflict(&conflict)
            .unwrap_or(conflict.resolution);
        self.apply_conflict(&conflict, strategy).await
    }

    async fn apply_conflict(
        &self,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
    ) -> Result<Applied> {
        let outcome = self.resolver.resolve_conflict(conflict, Some(strategy));
        tracing::debug!(
            external_id = %conflict.source.id,
            conflict_type = %conflict.conflict_type,
            strategy = %strategy,
            "Resolving conflict"
        );

        let mut applied = Applied::written(OperationKind::Update, conflict.mirror.id);
        applied.warnings = outcome.warnings;
        match strategy {
            ResolutionStrategy::Skip => applied.skipped = true,
            ResolutionStrategy::MirrorWins => {}
            ResolutionStrategy::SourceWins | ResolutionStrategy::Merge => {
                let draft = MirrorDraft::from_record(&outcome.record);
                self.update(&conflict.source, &draft).await?;
            }
        }
        Ok(applied)
    }

    async fn update(&self, record: &Record, draft: &MirrorDraft) -> Result<u64> {
        self.store
            .update_by_filter(&MirrorFilter::ExternalId(record.id.clone()), draft)
            .await
    }

    fn track(&self, progress: SyncProgress) {
        let mut runs = self.progress.write();
        let finished = runs.values().filter(|entry| entry.finished).count();
        if finished >= PROGRESS_RETENTION {
            let mut done: Vec<(DateTime<Utc>, Uuid)> = runs
                .values()
                .filter(|entry| entry.finished)
                .map(|entry| (entry.started_at, entry.run_id))
                .collect();
            done.sort();
            for (_, run_id) in done.iter().take(finished + 1 - PROGRESS_RETENTION) {
                runs.remove(run_id);
            }
        }
        runs.insert(progress.run_id, progress);
    }

    fn update_progress(
        &self,
        run_id: Uuid,
        apply: impl FnOnce(&mut SyncProgress),
    ) -> Option<SyncProgress> {
        let mut runs = self.progress.write();
        let progress = runs.get_mut(&run_id)?;
        apply(progress);
        Some(progress.clone())
    }
}

pub(crate) fn empty_batch(batch_id: Uuid, kind: RunKind) -> SyncBatch {
    let mut batch = SyncBatch::new(batch_id, kind, 0);
    batch.start();
    batch.finish();
    batch
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::error::{SourceError, StoreError};
    use crate::models::{BatchStatus, MirrorRecord, MirrorStatus, OperationStatus, PublicationStatus};
    use crate::source::MemorySourceClient;
    use crate::store::MemoryMirrorStore;
    use crate::sync::NoopObserver;

    fn record(id: &str, updated_at: DateTime<Utc>) -> Record {
        Record {
            id: id.to_string(),
            title: format!("Title {id}"),
            slug: format!("slug-{id}"),
            tags: BTreeSet::from(["rust".to_string()]),
            category: None,
            summary: None,
            status: PublicationStatus::Public,
            created_at: updated_at,
            date: updated_at,
            updated_at,
            thumbnail: None,
        }
    }

    fn fast_config() -> RuntimeConfig {
        RuntimeConfig {
            batch_size: 2,
            delay_between_batches_ms: 0,
            retry_base_delay_ms: 1,
            max_retry_delay_ms: 5,
            ..RuntimeConfig::default()
        }
    }

    fn processor(
        source: &Arc<MemorySourceClient>,
        store: &MemoryMirrorStore,
        config: RuntimeConfig,
    ) -> BatchProcessor {
        BatchProcessor::new(
            source.clone(),
            Arc::new(store.clone()),
            SharedConfig::new(config),
            Arc::new(NoopObserver),
        )
    }

    fn records(count: usize) -> Vec<Record> {
        let now = Utc::now();
        (0..count).map(|index| record(&format!("n{index}"), now)).collect()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrency_within_a_chunk_is_bounded() {
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        store.set_latency(Some(Duration::from_millis(20)));
        let config = RuntimeConfig {
            batch_size: 10,
            max_concurrency: 3,
            ..fast_config()
        };
        let options = BatchOptions::from_config(&config, ConflictCheck::None);

        let batch = processor(&source, &store, config)
            .run(Uuid::now_v7(), RunKind::Manual, records(10), &options)
            .await;

        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(batch.success, 10);
        assert!(store.max_in_flight() <= 3, "saw {}", store.max_in_flight());
        assert!(store.max_in_flight() >= 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn one_failing_record_does_not_abort_siblings() {
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        let mut input = records(4);
        // Same slug as n0 violates the unique constraint on insert
        input[3].slug = input[0].slug.clone();
        let config = RuntimeConfig {
            max_retries: 0,
            ..fast_config()
        };
        let options = BatchOptions::from_config(&config, ConflictCheck::None);

        let batch = processor(&source, &store, config)
            .run(Uuid::now_v7(), RunKind::Manual, input, &options)
            .await;

        assert_eq!(batch.success, 3);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.errors.len(), 1);
        assert!(batch.errors[0].starts_with("n3: "));
        assert_eq!(store.rows().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn transient_store_errors_are_retried_on_the_same_operation() {
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        store.fail_next(2, StoreError::Other("connection reset by peer".to_string()));
        let config = fast_config();
        let options = BatchOptions::from_config(&config, ConflictCheck::None);

        let batch = processor(&source, &store, config)
            .run(Uuid::now_v7(), RunKind::Manual, records(1), &options)
            .await;

        assert_eq!(batch.success, 1);
        let operation = &batch.operations[0];
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.retry_count, 2);
        assert_eq!(operation.kind, OperationKind::Create);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn progress_is_tracked_per_run() {
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        let config = fast_config();
        let options = BatchOptions::from_config(&config, ConflictCheck::None);
        let processor = processor(&source, &store, config);

        let batch = processor
            .run(Uuid::now_v7(), RunKind::Manual, records(5), &options)
            .await;

        let progress = processor.progress(batch.id).unwrap();
        assert_eq!(progress.total, 5);
        assert_eq!(progress.processed, 5);
        assert_eq!(progress.success, 5);
        assert_eq!(progress.total_chunks, 3);
        assert_eq!(progress.current_chunk, 3);
        assert!(progress.finished);
        assert!(processor.active_progress().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_migration_replaces_mirror_contents() {
        let source = Arc::new(MemorySourceClient::with_records(records(3)));
        let store = MemoryMirrorStore::new();
        let stale = record("stale", Utc::now());
        store.seed(MirrorRecord::from_draft(
            Uuid::now_v7(),
            MirrorDraft::from_record(&stale),
        ));

        let batch = processor(&source, &store, fast_config())
            .initial_migration(Uuid::now_v7())
            .await
            .unwrap();

        assert_eq!(batch.kind, RunKind::Full);
        assert_eq!(batch.success, 3);
        let mut ids: Vec<String> = store.rows().into_iter().map(|row| row.external_id).collect();
        ids.sort();
        assert_eq!(ids, vec!["n0", "n1", "n2"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn initial_migration_with_empty_source_keeps_mirror() {
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        store.seed(MirrorRecord::from_draft(
            Uuid::now_v7(),
            MirrorDraft::from_record(&record("kept", Utc::now())),
        ));

        let batch = processor(&source, &store, fast_config())
            .initial_migration(Uuid::now_v7())
            .await
            .unwrap();

        assert_eq!(batch.total, 0);
        assert_eq!(batch.status, BatchStatus::Completed);
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn source_outage_fails_the_whole_run() {
        let source = Arc::new(MemorySourceClient::new());
        source.fail_always(Some(SourceError::Http {
            status: 401,
            retry_after_ms: None,
            message: "bad token".to_string(),
        }));
        let store = MemoryMirrorStore::new();

        let err = processor(&source, &store, fast_config())
            .initial_migration(Uuid::now_v7())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Classified(_)));
        assert_eq!(store.writes(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn conflict_aware_mode_merges_mirror_edits() {
        let now = Utc::now();
        let source_record = record("n1", now - TimeDelta::minutes(30));
        let source = Arc::new(MemorySourceClient::with_records(vec![source_record.clone()]));
        let store = MemoryMirrorStore::new();
        let mut row = MirrorRecord::from_draft(
            Uuid::now_v7(),
            MirrorDraft::from_record(&source_record),
        );
        row.title = "Edited on the mirror".to_string();
        row.tags.insert("mirror-only".to_string());
        row.updated_at = now - TimeDelta::minutes(20);
        store.seed(row);

        let batch = processor(&source, &store, fast_config())
            .incremental_with_conflicts(Uuid::now_v7(), Some(now - TimeDelta::hours(1)))
            .await
            .unwrap();

        assert_eq!(batch.kind, RunKind::Incremental);
        assert_eq!(batch.success, 1);
        assert_eq!(batch.operations[0].kind, OperationKind::Update);
        let stored = store.rows().pop().unwrap();
        assert_eq!(stored.title, source_record.title);
        assert_eq!(stored.status, MirrorStatus::Published);
        assert!(stored.tags.contains("mirror-only"));
        assert!(stored.tags.contains("rust"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn coarse_skip_leaves_row_untouched() {
        let now = Utc::now();
        let source_record = record("n1", now - TimeDelta::minutes(30));
        let source = Arc::new(MemorySourceClient::new());
        let store = MemoryMirrorStore::new();
        let mut row = MirrorRecord::from_draft(
            Uuid::now_v7(),
            MirrorDraft::from_record(&source_record),
        );
        row.title = "Mirror title".to_string();
        row.updated_at = now;
        store.seed(row);
        let config = RuntimeConfig {
            conflict_resolution: ResolutionStrategy::Skip,
            ..fast_config()
        };
        let options = BatchOptions::from_config(&config, ConflictCheck::Coarse);

        let batch = processor(&source, &store, config)
            .run(Uuid::now_v7(), RunKind::Manual, vec![source_record], &options)
            .await;

        assert_eq!(batch.skipped, 1);
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(store.rows()[0].title, "Mirror title");
    }
}
