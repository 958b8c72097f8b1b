//! Error types for postmirror-core

use thiserror::Error;

use crate::classify::ClassifiedError;
use crate::models::SyncDirection;

/// Result type alias using postmirror-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in postmirror-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Failure reported by the source client
    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    /// Structured failure reported by a mirror store
    #[error("Mirror store error: {0}")]
    Store(#[from] StoreError),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The requested direction is never performed
    #[error("Unsupported sync direction: {0}. The source is the sole authority for records")]
    UnsupportedDirection(SyncDirection),

    /// Another sync run holds the run lock
    #[error("A sync run is already in progress")]
    SyncInProgress,

    /// A read exhausted both origins
    #[error("Both primary and fallback sources failed. Primary: {primary}, Fallback: {fallback}")]
    BothOriginsFailed {
        primary: ClassifiedError,
        fallback: ClassifiedError,
    },

    /// A read failed on one origin and was not eligible for fallback
    #[error("{0}")]
    Classified(ClassifiedError),
}

/// HTTP-shaped failures from the source of truth
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        retry_after_ms: Option<u64>,
        message: String,
    },
    #[error("network failure: {0}")]
    Network(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Structured mirror store error codes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No row matched the filter
    #[error("no matching row: {0}")]
    NotFound(String),
    /// A unique constraint (external id or slug) was violated
    #[error("unique constraint violated on {field}: {value}")]
    UniqueViolation { field: String, value: String },
    /// The handle lacks the role required for the operation
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("{0}")]
    Other(String),
}
