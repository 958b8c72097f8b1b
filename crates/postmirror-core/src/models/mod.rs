//! Data models for Postmirror

mod mirror;
mod record;
mod sync;
mod webhook;

pub use mirror::{MirrorDraft, MirrorRecord, MirrorStatus};
pub use record::{PublicationStatus, Record, RecordDetail};
pub use sync::{
    BatchStatus, ConflictType, OperationKind, OperationStatus, ResolutionStrategy, RunKind,
    RunStatus, SyncBatch, SyncConflict, SyncDirection, SyncOperation, SyncProgress, SyncRun,
    SyncStats, MAX_BATCH_ERRORS,
};
pub use webhook::{WebhookEvent, WebhookPayload};
