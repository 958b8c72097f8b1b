//! Mirror store abstraction: the relational copy of source records.
//!
//! Two handles exist per deployment. The read path gets a
//! [`StoreRole::ReadOnly`] handle; writes (sync, webhook deletes) require the
//! elevated [`StoreRole::Service`] handle. Both roles see the same rows.

mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::models::{MirrorDraft, MirrorRecord, MirrorStatus, SyncRun};

pub use memory::MemoryMirrorStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreRole {
    ReadOnly,
    Service,
}

impl StoreRole {
    /// Reject writes on read-only handles
    pub fn ensure_writable(self) -> Result<()> {
        match self {
            Self::Service => Ok(()),
            Self::ReadOnly => Err(StoreError::PermissionDenied(
                "mirror handle is read-only; writes need the service role".to_string(),
            )
            .into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorFilter {
    All,
    ExternalId(String),
    ExternalIds(Vec<String>),
    Slug(String),
    Status(MirrorStatus),
    UpdatedAfter(DateTime<Utc>),
}

impl MirrorFilter {
    pub fn matches(&self, row: &MirrorRecord) -> bool {
        match self {
            Self::All => true,
            Self::ExternalId(id) => &row.external_id == id,
            Self::ExternalIds(ids) => ids.contains(&row.external_id),
            Self::Slug(slug) => &row.slug == slug,
            Self::Status(status) => row.status == *status,
            Self::UpdatedAfter(since) => row.updated_at > *since,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOrder {
    /// Newest publication first, unpublished rows last
    PublishedAtDesc,
    UpdatedAtDesc,
}

impl MirrorOrder {
    pub fn compare(self, left: &MirrorRecord, right: &MirrorRecord) -> Ordering {
        match self {
            Self::PublishedAtDesc => right
                .published_at
                .cmp(&left.published_at)
                .then_with(|| right.created_at.cmp(&left.created_at)),
            Self::UpdatedAtDesc => right.updated_at.cmp(&left.updated_at),
        }
    }
}

/// Filterable, sortable, paginated query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorQuery {
    pub filter: MirrorFilter,
    pub order: Option<MirrorOrder>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl MirrorQuery {
    pub const fn new(filter: MirrorFilter) -> Self {
        Self {
            filter,
            order: None,
            limit: None,
            offset: 0,
        }
    }

    pub const fn all() -> Self {
        Self::new(MirrorFilter::All)
    }

    #[must_use]
    pub const fn order(mut self, order: MirrorOrder) -> Self {
        self.order = Some(order);
        self
    }

    #[must_use]
    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub const fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// CRUD access to the mirror.
///
/// Unique violations (external id, slug) surface as
/// [`StoreError::UniqueViolation`]; an update matching no row surfaces as
/// [`StoreError::NotFound`].
#[async_trait]
pub trait MirrorStore: Send + Sync {
    fn role(&self) -> StoreRole;

    async fn query(&self, query: &MirrorQuery) -> Result<Vec<MirrorRecord>>;

    async fn insert(&self, draft: &MirrorDraft) -> Result<MirrorRecord>;

    /// Overwrite matching rows with `draft`; returns the number updated
    async fn update_by_filter(&self, filter: &MirrorFilter, draft: &MirrorDraft) -> Result<u64>;

    /// Remove matching rows; returns the number removed
    async fn delete_by_filter(&self, filter: &MirrorFilter) -> Result<u64>;

    /// Cheapest possible round trip, used by health checks
    async fn ping(&self) -> Result<()>;

    async fn find_by_external_id(&self, external_id: &str) -> Result<Option<MirrorRecord>> {
        let query = MirrorQuery::new(MirrorFilter::ExternalId(external_id.to_string())).limit(1);
        Ok(self.query(&query).await?.into_iter().next())
    }

    async fn count(&self, filter: &MirrorFilter) -> Result<usize> {
        Ok(self.query(&MirrorQuery::new(filter.clone())).await?.len())
    }
}

/// Durable storage for sync run bookkeeping
#[async_trait]
pub trait SyncRunStore: Send + Sync {
    /// Insert or replace by run id
    async fn save_run(&self, run: &SyncRun) -> Result<()>;

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>>;

    /// Newest first
    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<SyncRun>>;

    /// Remove runs started before `cutoff`; returns the number removed
    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}
