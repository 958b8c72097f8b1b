//! Sync bookkeeping: operations, batches, runs, conflicts

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::mirror::MirrorRecord;
use super::record::Record;

/// Per-batch cap on retained error and warning messages
pub const MAX_BATCH_ERRORS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncDirection {
    SourceToMirror,
    /// Never performed: the source is the sole authority
    MirrorToSource,
    Bidirectional,
}

impl SyncDirection {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceToMirror => "source-to-mirror",
            Self::MirrorToSource => "mirror-to-source",
            Self::Bidirectional => "bidirectional",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "source-to-mirror" => Ok(Self::SourceToMirror),
            "mirror-to-source" => Ok(Self::MirrorToSource),
            "bidirectional" => Ok(Self::Bidirectional),
            other => Err(format!("unknown sync direction: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    /// Left untouched on purpose (skip resolution)
    Skipped,
}

/// One record-level write against the mirror.
///
/// A retry is another attempt of the same operation: the id is kept and
/// `retry_count` grows until `max_retries`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub direction: SyncDirection,
    pub external_id: String,
    pub mirror_id: Option<Uuid>,
    pub status: OperationStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl SyncOperation {
    pub fn new(kind: OperationKind, external_id: impl Into<String>, max_retries: u32) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            direction: SyncDirection::SourceToMirror,
            external_id: external_id.into(),
            mirror_id: None,
            status: OperationStatus::Pending,
            retry_count: 0,
            max_retries,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn start(&mut self) {
        self.status = OperationStatus::InProgress;
    }

    pub fn complete(&mut self) {
        self.status = OperationStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn skip(&mut self) {
        self.status = OperationStatus::Skipped;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.status = OperationStatus::Failed;
        self.last_error = Some(message.into());
        self.completed_at = Some(Utc::now());
    }

    /// Whether another attempt fits in the retry budget
    pub const fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Start the next attempt, remembering why the last one failed
    pub fn retry(&mut self, message: impl Into<String>) {
        self.retry_count += 1;
        self.last_error = Some(message.into());
        self.status = OperationStatus::InProgress;
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::Skipped
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Created,
    InProgress,
    Completed,
    Failed,
}

/// Aggregate of the operations performed by one sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub id: Uuid,
    pub kind: RunKind,
    pub status: BatchStatus,
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub operations: Vec<SyncOperation>,
}

impl SyncBatch {
    pub fn new(id: Uuid, kind: RunKind, total: usize) -> Self {
        Self {
            id,
            kind,
            status: BatchStatus::Created,
            total,
            success: 0,
            failed: 0,
            skipped: 0,
            started_at: Utc::now(),
            completed_at: None,
            errors: Vec::new(),
            warnings: Vec::new(),
            operations: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        self.status = BatchStatus::InProgress;
        self.started_at = Utc::now();
    }

    /// Fold a terminal operation into the counters
    pub fn record(&mut self, operation: SyncOperation) {
        match operation.status {
            OperationStatus::Completed => self.success += 1,
            OperationStatus::Skipped => self.skipped += 1,
            OperationStatus::Failed => {
                self.failed += 1;
                let message = operation.last_error.as_deref().unwrap_or("unknown error");
                self.push_error(format!("{}: {message}", operation.external_id));
            }
            OperationStatus::Pending | OperationStatus::InProgress => {}
        }
        self.operations.push(operation);
    }

    pub fn push_error(&mut self, message: impl Into<String>) {
        if self.errors.len() < MAX_BATCH_ERRORS {
            self.errors.push(message.into());
        }
    }

    pub fn push_warning(&mut self, message: impl Into<String>) {
        if self.warnings.len() < MAX_BATCH_ERRORS {
            self.warnings.push(message.into());
        }
    }

    pub fn finish(&mut self) {
        self.status = BatchStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Terminate on an infrastructure-level error
    pub fn abort(&mut self, message: impl Into<String>) {
        self.push_error(message);
        self.status = BatchStatus::Failed;
        self.completed_at = Some(Utc::now());
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self.status, BatchStatus::Completed | BatchStatus::Failed)
    }

    /// Records written or deliberately left alone
    pub const fn processed(&self) -> usize {
        self.success + self.failed + self.skipped
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Full,
    Incremental,
    Manual,
}

impl RunKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Incremental => "incremental",
            Self::Manual => "manual",
        }
    }
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown run kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}

/// Persisted start/finish bookkeeping for one sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: Uuid,
    pub kind: RunKind,
    pub direction: SyncDirection,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_synced: u64,
    pub status: RunStatus,
    pub error: Option<String>,
}

impl SyncRun {
    pub fn start(kind: RunKind, direction: SyncDirection) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            direction,
            started_at: Utc::now(),
            completed_at: None,
            records_synced: 0,
            status: RunStatus::Running,
            error: None,
        }
    }

    pub fn finish(&mut self, records_synced: u64, success: bool, error: Option<String>) {
        self.records_synced = records_synced;
        self.status = if success {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        self.error = error;
        self.completed_at = Some(Utc::now());
    }

    /// Time used when asking "what changed since the last sync"
    pub fn effective_time(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.started_at)
    }
}

/// Live progress of one batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncProgress {
    pub run_id: Uuid,
    pub total: usize,
    pub processed: usize,
    pub success: usize,
    pub failed: usize,
    pub skipped: usize,
    pub current_chunk: usize,
    pub total_chunks: usize,
    pub started_at: DateTime<Utc>,
    pub estimated_completion: Option<DateTime<Utc>>,
    pub finished: bool,
}

impl SyncProgress {
    pub fn new(run_id: Uuid, total: usize, total_chunks: usize) -> Self {
        Self {
            run_id,
            total,
            processed: 0,
            success: 0,
            failed: 0,
            skipped: 0,
            current_chunk: 0,
            total_chunks,
            started_at: Utc::now(),
            estimated_completion: None,
            finished: false,
        }
    }

    /// Count one finished record and re-extrapolate the completion time
    pub fn record(&mut self, status: OperationStatus, now: DateTime<Utc>) {
        self.processed += 1;
        match status {
            OperationStatus::Completed => self.success += 1,
            OperationStatus::Failed => self.failed += 1,
            OperationStatus::Skipped => self.skipped += 1,
            OperationStatus::Pending | OperationStatus::InProgress => {}
        }
        self.estimated_completion = self.estimate(now);
    }

    /// Linear extrapolation: elapsed time per processed item times items left
    pub fn estimate(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.processed == 0 {
            return None;
        }
        let elapsed_ms = (now - self.started_at).num_milliseconds().max(0);
        let processed = i64::try_from(self.processed).ok()?;
        let remaining = i64::try_from(self.total.saturating_sub(self.processed)).ok()?;
        let per_item_ms = elapsed_ms / processed;
        Some(now + TimeDelta::milliseconds(per_item_ms.saturating_mul(remaining)))
    }
}

/// Snapshot returned by the status surfaces
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub total_records: usize,
    pub synced_records: usize,
    pub pending_records: usize,
    pub failed_records: usize,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    Content,
    Metadata,
    Timestamp,
}

impl ConflictType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Content => "content",
            Self::Metadata => "metadata",
            Self::Timestamp => "timestamp",
        }
    }
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a conflicting pair is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    #[default]
    SourceWins,
    /// Manual override only; never recommended automatically
    MirrorWins,
    Merge,
    /// Manual override only; never recommended automatically
    Skip,
}

impl ResolutionStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SourceWins => "source-wins",
            Self::MirrorWins => "mirror-wins",
            Self::Merge => "merge",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "source-wins" => Ok(Self::SourceWins),
            "mirror-wins" => Ok(Self::MirrorWins),
            "merge" => Ok(Self::Merge),
            "skip" => Ok(Self::Skip),
            other => Err(format!("unknown resolution strategy: {other}")),
        }
    }
}

/// Divergence between a source record and its mirror row, scoped to one pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub source: Record,
    pub mirror: MirrorRecord,
    pub conflict_type: ConflictType,
    pub resolution: ResolutionStrategy,
    pub confidence: f64,
}
