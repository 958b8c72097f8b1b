//! Fetch-only access to the source of truth

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;

use crate::error::{Error, Result, SourceError};
use crate::models::{Record, RecordDetail};
use crate::util::{compact_text, is_http_url, sanitize};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only client for canonical records. Calls must be idempotent.
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Every record the source holds, regardless of publication status
    async fn list_all(&self) -> Result<Vec<Record>>;

    /// A record with its body, looked up by source id
    async fn get_detail(&self, id: &str) -> Result<RecordDetail>;
}

/// HTTP JSON client: `GET {base}/records` and `GET {base}/records/{id}`
#[derive(Clone)]
pub struct HttpSourceClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl HttpSourceClient {
    pub fn new(base_url: impl Into<String>, api_token: Option<String>) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "source URL must start with http:// or https://".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|error| Error::Source(SourceError::Network(sanitize(&error))))?;
        Ok(Self {
            client,
            base_url,
            api_token,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{path}", self.base_url);
        let mut request = self.client.get(&url).header("Accept", "application/json");
        if let Some(token) = self.api_token.as_deref() {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1_000));
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Source(SourceError::Http {
                status: status.as_u16(),
                retry_after_ms,
                message: compact_text(&body),
            }));
        }

        response
            .json::<T>()
            .await
            .map_err(|error| Error::Source(SourceError::Decode(sanitize(&error))))
    }
}

impl fmt::Debug for HttpSourceClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HttpSourceClient")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn list_all(&self) -> Result<Vec<Record>> {
        let records: Vec<Record> = self.get_json("/records").await?;
        tracing::debug!(count = records.len(), "Fetched records from source");
        Ok(records)
    }

    async fn get_detail(&self, id: &str) -> Result<RecordDetail> {
        let path = format!("/records/{}", urlencoding::encode(id));
        self.get_json(&path).await
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    let message = sanitize(&error);
    if error.is_timeout() {
        Error::Source(SourceError::Timeout(message))
    } else if error.is_decode() {
        Error::Source(SourceError::Decode(message))
    } else {
        Error::Source(SourceError::Network(message))
    }
}

/// In-process source used by tests and local tooling.
///
/// Failures can be queued (`fail_next`) or made permanent (`fail_always`);
/// call counters let tests assert that a path was or was not taken.
#[derive(Default)]
pub struct MemorySourceClient {
    records: RwLock<Vec<Record>>,
    bodies: RwLock<HashMap<String, serde_json::Value>>,
    queued_failures: Mutex<VecDeque<SourceError>>,
    permanent_failure: Mutex<Option<SourceError>>,
    list_calls: AtomicUsize,
    detail_calls: AtomicUsize,
}

impl MemorySourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: Vec<Record>) -> Self {
        let client = Self::default();
        *client.records.write() = records;
        client
    }

    /// Insert or replace a record by id
    pub fn upsert(&self, record: Record) {
        let mut records = self.records.write();
        if let Some(existing) = records.iter_mut().find(|item| item.id == record.id) {
            *existing = record;
        } else {
            records.push(record);
        }
    }

    pub fn remove(&self, id: &str) {
        self.records.write().retain(|record| record.id != id);
        self.bodies.write().remove(id);
    }

    pub fn set_body(&self, id: &str, body: serde_json::Value) {
        self.bodies.write().insert(id.to_string(), body);
    }

    /// Fail the next `count` calls with `error`
    pub fn fail_next(&self, count: usize, error: SourceError) {
        let mut queue = self.queued_failures.lock();
        queue.extend(std::iter::repeat(error).take(count));
    }

    /// Fail every call until cleared with `None`
    pub fn fail_always(&self, error: Option<SourceError>) {
        *self.permanent_failure.lock() = error;
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn detail_calls(&self) -> usize {
        self.detail_calls.load(Ordering::SeqCst)
    }

    pub fn total_calls(&self) -> usize {
        self.list_calls() + self.detail_calls()
    }

    fn injected_failure(&self) -> Option<SourceError> {
        if let Some(error) = self.permanent_failure.lock().clone() {
            return Some(error);
        }
        self.queued_failures.lock().pop_front()
    }
}

#[async_trait]
impl SourceClient for MemorySourceClient {
    async fn list_all(&self) -> Result<Vec<Record>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected_failure() {
            return Err(error.into());
        }
        Ok(self.records.read().clone())
    }

    async fn get_detail(&self, id: &str) -> Result<RecordDetail> {
        self.detail_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.injected_failure() {
            return Err(error.into());
        }
        let record = self
            .records
            .read()
            .iter()
            .find(|record| record.id == id)
            .cloned()
            .ok_or_else(|| {
                Error::Source(SourceError::Http {
                    status: 404,
                    retry_after_ms: None,
                    message: format!("no record with id {id}"),
                })
            })?;
        let body = self
            .bodies
            .read()
            .get(&record.id)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(RecordDetail { record, body })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::PublicationStatus;

    fn record(id: &str, slug: &str) -> Record {
        let now = Utc::now();
        Record {
            id: id.to_string(),
            title: id.to_uppercase(),
            slug: slug.to_string(),
            tags: std::collections::BTreeSet::new(),
            category: None,
            summary: None,
            status: PublicationStatus::Public,
            created_at: now,
            date: now,
            updated_at: now,
            thumbnail: None,
        }
    }

    #[test]
    fn http_client_rejects_non_http_urls() {
        assert!(HttpSourceClient::new("ftp://example.com", None).is_err());
        let client = HttpSourceClient::new("https://example.com/api/", Some("secret".into()))
            .unwrap();
        let debug = format!("{client:?}");
        assert!(debug.contains("https://example.com/api"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_source_resolves_detail_by_id_only() {
        let source = MemorySourceClient::with_records(vec![record("n1", "hello")]);
        source.set_body("n1", serde_json::json!({"blocks": []}));

        let by_id = source.get_detail("n1").await.unwrap();
        assert_eq!(by_id.record.slug, "hello");
        assert_eq!(by_id.body, serde_json::json!({"blocks": []}));
        assert!(matches!(
            source.get_detail("hello").await,
            Err(Error::Source(SourceError::Http { status: 404, .. }))
        ));
        assert_eq!(source.detail_calls(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_source_replays_queued_failures() {
        let source = MemorySourceClient::with_records(vec![record("n1", "hello")]);
        source.fail_next(1, SourceError::Network("reset".into()));

        assert!(source.list_all().await.is_err());
        assert_eq!(source.list_all().await.unwrap().len(), 1);
        assert_eq!(source.list_calls(), 2);
    }
}
