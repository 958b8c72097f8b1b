//! Error classification for the read and write paths.
//!
//! [`classify`] is the only place that inspects raw failures. Everything
//! downstream (retry loops, fallback decisions, per-record sync failures)
//! works on the [`ClassifiedError`] it produces.

use std::fmt;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, SourceError, StoreError};
use crate::util::{duration_millis, sanitize};

const NETWORK_PATTERNS: [&str; 7] = [
    "fetch failed",
    "other side closed",
    "network",
    "timeout",
    "timed out",
    "connection refused",
    "connection reset",
];

/// Which backing store produced a result or failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Mirror,
    Source,
}

impl Origin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::Source => "source",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Authentication,
    RateLimit { retry_after_ms: Option<u64> },
    Unavailable,
    Generic,
}

impl ErrorKind {
    pub const fn label(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Authentication => "authentication",
            Self::RateLimit { .. } => "rate_limit",
            Self::Unavailable => "unavailable",
            Self::Generic => "generic",
        }
    }
}

/// A failure reduced to the taxonomy the retry and fallback policies use
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[error("{message}")]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub origin: Origin,
    pub retryable: bool,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: ErrorKind, origin: Origin, message: impl Into<String>) -> Self {
        Self {
            kind,
            origin,
            retryable: is_retryable(kind),
            message: message.into(),
        }
    }
}

/// Classify a raw failure. Rules are checked in order:
/// structured store codes, HTTP status, transport failures, then message
/// patterns on the catch-all variants. Anything unmatched is `Generic`.
pub fn classify(error: &Error, origin: Origin) -> ClassifiedError {
    if let Error::Classified(classified) = error {
        return classified.clone();
    }
    let kind = kind_of(error);
    ClassifiedError::new(kind, origin, sanitize(error))
}

fn kind_of(error: &Error) -> ErrorKind {
    match error {
        Error::NotFound(_) | Error::Store(StoreError::NotFound(_)) => ErrorKind::NotFound,
        Error::Store(StoreError::PermissionDenied(_)) => ErrorKind::Authentication,
        Error::Source(SourceError::Http {
            status,
            retry_after_ms,
            message,
        }) => match status {
            404 => ErrorKind::NotFound,
            401 | 403 => ErrorKind::Authentication,
            429 => ErrorKind::RateLimit {
                retry_after_ms: *retry_after_ms,
            },
            500..=599 => ErrorKind::Unavailable,
            _ => kind_from_message(message),
        },
        Error::Source(SourceError::Network(_) | SourceError::Timeout(_)) => {
            ErrorKind::Unavailable
        }
        Error::Io(io) => match io.kind() {
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::ConnectionRefused
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorKind::Unavailable,
            _ => kind_from_message(&io.to_string()),
        },
        Error::Store(StoreError::Other(message)) => kind_from_message(message),
        Error::LibSql(inner) => kind_from_message(&inner.to_string()),
        _ => ErrorKind::Generic,
    }
}

fn kind_from_message(message: &str) -> ErrorKind {
    let lowered = message.to_ascii_lowercase();
    if NETWORK_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        ErrorKind::Unavailable
    } else {
        ErrorKind::Generic
    }
}

/// `false` for `NotFound` and `Authentication`, `true` otherwise
pub const fn is_retryable(kind: ErrorKind) -> bool {
    !matches!(kind, ErrorKind::NotFound | ErrorKind::Authentication)
}

/// Delay before the next attempt (`attempt` is 1-based).
///
/// A rate limit with a retry-after hint waits exactly that long, capped at
/// `max`. Otherwise `2^(attempt-1) * base` plus up to 10% jitter, capped at
/// `max`. The jitter never exceeds the gap to the next step, so the delay is
/// non-decreasing in `attempt`.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn backoff_delay(
    attempt: u32,
    base: Duration,
    max: Duration,
    error: Option<&ClassifiedError>,
) -> Duration {
    let max_ms = duration_millis(max);
    if let Some(ClassifiedError {
        kind:
            ErrorKind::RateLimit {
                retry_after_ms: Some(retry_after_ms),
            },
        ..
    }) = error
    {
        return Duration::from_millis((*retry_after_ms).min(max_ms));
    }

    let exponent = attempt.max(1) - 1;
    let exponential_ms = duration_millis(base).saturating_mul(2u64.saturating_pow(exponent));
    let jitter_ms = (exponential_ms as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
    Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
}

/// Conditions under which a failed primary read may use the secondary origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConditions {
    /// Fall back on any retryable failure
    pub on_error: bool,
    /// Fall back when the primary is unreachable
    pub on_unavailable: bool,
}

impl Default for FallbackConditions {
    fn default() -> Self {
        Self {
            on_error: true,
            on_unavailable: true,
        }
    }
}

/// Whether a failure of `kind` on the primary origin may be served by the secondary
pub const fn should_fallback(
    kind: ErrorKind,
    fallback_enabled: bool,
    conditions: FallbackConditions,
) -> bool {
    if !fallback_enabled {
        return false;
    }
    match kind {
        ErrorKind::Authentication => false,
        ErrorKind::Unavailable if conditions.on_unavailable => true,
        ErrorKind::NotFound => true,
        _ => is_retryable(kind) && conditions.on_error,
    }
}
