use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::{MirrorFilter, MirrorQuery, MirrorStore, StoreRole, SyncRunStore};
use crate::error::{Result, StoreError};
use crate::models::{MirrorDraft, MirrorRecord, SyncRun};

#[derive(Default)]
struct MemoryState {
    rows: RwLock<Vec<MirrorRecord>>,
    runs: RwLock<Vec<SyncRun>>,
    queued_failures: Mutex<VecDeque<StoreError>>,
    permanent_failure: Mutex<Option<StoreError>>,
    latency: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    writes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

/// In-process mirror enforcing the same uniqueness rules as the libSQL store.
///
/// Handles created with [`MemoryMirrorStore::read_only`] share rows with the
/// handle they came from. Latency and failure injection plus call counters
/// make it usable as a test double.
#[derive(Clone)]
pub struct MemoryMirrorStore {
    state: Arc<MemoryState>,
    role: StoreRole,
}

struct CallGuard<'a>(&'a AtomicUsize);

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryMirrorStore {
    /// Empty store with the service role
    pub fn new() -> Self {
        Self {
            state: Arc::new(MemoryState::default()),
            role: StoreRole::Service,
        }
    }

    /// Read-only handle over the same rows
    #[must_use]
    pub fn read_only(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            role: StoreRole::ReadOnly,
        }
    }

    /// Sleep this long inside every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.state.latency.lock() = latency;
    }

    pub fn fail_next(&self, count: usize, error: StoreError) {
        let mut queue = self.state.queued_failures.lock();
        queue.extend(std::iter::repeat(error).take(count));
    }

    pub fn fail_always(&self, error: Option<StoreError>) {
        *self.state.permanent_failure.lock() = error;
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.state.writes.load(Ordering::SeqCst)
    }

    /// Highest number of calls observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn rows(&self) -> Vec<MirrorRecord> {
        self.state.rows.read().clone()
    }

    /// Place a row directly, bypassing role checks and counters
    pub fn seed(&self, row: MirrorRecord) {
        self.state.rows.write().push(row);
    }

    async fn begin(&self) -> Result<CallGuard<'_>> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let guard = CallGuard(&self.state.in_flight);

        let latency = *self.state.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let permanent = self.state.permanent_failure.lock().clone();
        if let Some(error) = permanent.or_else(|| self.state.queued_failures.lock().pop_front()) {
            return Err(error.into());
        }
        Ok(guard)
    }

    async fn begin_write(&self) -> Result<CallGuard<'_>> {
        self.role.ensure_writable()?;
        let guard = self.begin().await?;
        self.state.writes.fetch_add(1, Ordering::SeqCst);
        Ok(guard)
    }
}

impl Default for MemoryMirrorStore {
    fn default() -> Self {
        Self::new()
    }
}

fn check_unique<'a>(
    rows: impl IntoIterator<Item = &'a MirrorRecord>,
    draft: &MirrorDraft,
) -> Result<()> {
    for row in rows {
        if row.external_id == draft.external_id {
            return Err(StoreError::UniqueViolation {
                field: "external_id".to_string(),
                value: draft.external_id.clone(),
            }
            .into());
        }
        if row.slug == draft.slug {
            return Err(StoreError::UniqueViolation {
                field: "slug".to_string(),
                value: draft.slug.clone(),
            }
            .into());
        }
    }
    Ok(())
}

#[async_trait]
impl MirrorStore for MemoryMirrorStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn query(&self, query: &MirrorQuery) -> Result<Vec<MirrorRecord>> {
        let _guard = self.begin().await?;
        let mut rows: Vec<MirrorRecord> = self
            .state
            .rows
            .read()
            .iter()
            .filter(|row| query.filter.matches(row))
            .cloned()
            .collect();
        if let Some(order) = query.order {
            rows.sort_by(|left, right| order.compare(left, right));
        }
        let rows = rows.into_iter().skip(query.offset);
        Ok(match query.limit {
            Some(limit) => rows.take(limit).collect(),
            None => rows.collect(),
        })
    }

    async fn insert(&self, draft: &MirrorDraft) -> Result<MirrorRecord> {
        let _guard = self.begin_write().await?;
        let mut rows = self.state.rows.write();
        check_unique(rows.iter(), draft)?;
        let row = MirrorRecord::from_draft(Uuid::now_v7(), draft.clone());
        rows.push(row.clone());
        Ok(row)
    }

    async fn update_by_filter(&self, filter: &MirrorFilter, draft: &MirrorDraft) -> Result<u64> {
        let _guard = self.begin_write().await?;
        let mut rows = self.state.rows.write();
        let (matched, others): (Vec<&MirrorRecord>, Vec<&MirrorRecord>) =
            rows.iter().partition(|row| filter.matches(row));
        if matched.is_empty() {
            return Err(StoreError::NotFound(format!("no row matches {filter:?}")).into());
        }
        if matched.len() > 1 {
            return Err(StoreError::UniqueViolation {
                field: "external_id".to_string(),
                value: draft.external_id.clone(),
            }
            .into());
        }
        check_unique(others, draft)?;

        let mut updated = 0;
        for row in rows.iter_mut().filter(|row| filter.matches(row)) {
            *row = MirrorRecord::from_draft(row.id, draft.clone());
            updated += 1;
        }
        Ok(updated)
    }

    async fn delete_by_filter(&self, filter: &MirrorFilter) -> Result<u64> {
        let _guard = self.begin_write().await?;
        let mut rows = self.state.rows.write();
        let before = rows.len();
        rows.retain(|row| !filter.matches(row));
        Ok((before - rows.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        let _guard = self.begin().await?;
        Ok(())
    }

    async fn count(&self, filter: &MirrorFilter) -> Result<usize> {
        let _guard = self.begin().await?;
        Ok(self
            .state
            .rows
            .read()
            .iter()
            .filter(|row| filter.matches(row))
            .count())
    }
}

#[async_trait]
impl SyncRunStore for MemoryMirrorStore {
    async fn save_run(&self, run: &SyncRun) -> Result<()> {
        let mut runs = self.state.runs.write();
        if let Some(existing) = runs.iter_mut().find(|item| item.id == run.id) {
            *existing = run.clone();
        } else {
            runs.push(run.clone());
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>> {
        Ok(self.state.runs.read().iter().find(|run| run.id == id).cloned())
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<SyncRun>> {
        let mut runs = self.state.runs.read().clone();
        runs.sort_by(|left, right| {
            right
                .started_at
                .cmp(&left.started_at)
                .then_with(|| right.id.cmp(&left.id))
        });
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut runs = self.state.runs.write();
        let before = runs.len();
        runs.retain(|run| run.started_at >= cutoff);
        Ok((before - runs.len()) as u64)
    }
}
