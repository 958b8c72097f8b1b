//! postmirror-core - Core library for Postmirror
//!
//! Keeps a relational mirror of records owned by an external source of truth
//! and serves reads through a hybrid layer that prefers the mirror but fails
//! over to the source. The write path (sync orchestration, batching, conflict
//! resolution, run bookkeeping) and the read path (cache, retry, fallback,
//! health) both live here; the API and CLI crates are thin shells around it.

pub mod batch;
pub mod cache;
pub mod classify;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod hybrid;
pub mod models;
pub mod retry;
pub mod source;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod util;

pub use batch::BatchProcessor;
pub use classify::{ClassifiedError, ErrorKind, Origin};
pub use config::{RuntimeConfig, RuntimeConfigPatch, SharedConfig};
pub use conflict::ConflictResolver;
pub use db::{Database, LibSqlMirrorStore, RemoteConfig};
pub use error::{Error, Result, SourceError, StoreError};
pub use hybrid::{HealthReport, HybridAccessService, OriginHealth, ServiceResponse};
pub use models::{
    MirrorRecord, MirrorStatus, PublicationStatus, Record, RecordDetail, ResolutionStrategy,
    SyncBatch, SyncConflict, SyncDirection, SyncOperation, SyncRun,
};
pub use source::{HttpSourceClient, MemorySourceClient, SourceClient};
pub use store::{MemoryMirrorStore, MirrorStore, StoreRole, SyncRunStore};
pub use sync::{NoopObserver, SyncObserver, SyncService, WebhookOutcome};
pub use tracker::TimestampTracker;
