//! Read path: cache, then mirror with retry, then source with retry.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;

use crate::cache::{CacheKey, CacheStats, ResponseCache};
use crate::classify::{should_fallback, Origin};
use crate::config::{RuntimeConfig, SharedConfig};
use crate::error::{Error, Result};
use crate::models::{MirrorRecord, MirrorStatus, Record, RecordDetail};
use crate::retry::{with_retry, RetryPolicy};
use crate::source::SourceClient;
use crate::store::{MirrorFilter, MirrorOrder, MirrorQuery, MirrorStore};
use crate::util::{duration_millis, sanitize};

/// Value tagged with where it came from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceResponse<T> {
    pub data: T,
    pub origin: Origin,
    /// Served by the secondary origin after the primary failed
    pub fallback: bool,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OriginHealth {
    pub status: HealthState,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl OriginHealth {
    const fn disabled() -> Self {
        Self {
            status: HealthState::Disabled,
            latency_ms: 0,
            error: None,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthState::Healthy
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// At least one origin answered
    pub healthy: bool,
    pub mirror: OriginHealth,
    pub source: OriginHealth,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
enum CachedValue {
    Collection(Vec<Record>),
    Record(Record),
    Detail(RecordDetail),
}

trait Cacheable: Clone + Sized {
    fn into_cached(self) -> CachedValue;
    fn from_cached(value: CachedValue) -> Option<Self>;
}

impl Cacheable for Vec<Record> {
    fn into_cached(self) -> CachedValue {
        CachedValue::Collection(self)
    }

    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Collection(records) => Some(records),
            _ => None,
        }
    }
}

impl Cacheable for Record {
    fn into_cached(self) -> CachedValue {
        CachedValue::Record(self)
    }

    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Record(record) => Some(record),
            _ => None,
        }
    }
}

impl Cacheable for RecordDetail {
    fn into_cached(self) -> CachedValue {
        CachedValue::Detail(self)
    }

    fn from_cached(value: CachedValue) -> Option<Self> {
        match value {
            CachedValue::Detail(detail) => Some(detail),
            _ => None,
        }
    }
}

/// Mirror-first reads with source fallback.
///
/// The mirror handle should be the read-only one; nothing here writes to
/// either origin. With no mirror configured the source is the primary and
/// there is no fallback.
pub struct HybridAccessService {
    mirror: Option<Arc<dyn MirrorStore>>,
    source: Arc<dyn SourceClient>,
    cache: ResponseCache<CachedValue>,
    config: SharedConfig,
}

impl HybridAccessService {
    pub fn new(
        mirror: Option<Arc<dyn MirrorStore>>,
        source: Arc<dyn SourceClient>,
        config: SharedConfig,
    ) -> Self {
        Self {
            mirror,
            source,
            cache: ResponseCache::new(),
            config,
        }
    }

    pub const fn is_mirror_enabled(&self) -> bool {
        self.mirror.is_some()
    }

    /// Publicly listed records, newest first
    pub async fn get_collection(&self) -> Result<ServiceResponse<Vec<Record>>> {
        self.read(
            CacheKey::COLLECTION,
            "list records",
            move |mirror| async move {
                let rows = mirror
                    .query(
                        &MirrorQuery::new(MirrorFilter::Status(MirrorStatus::Published))
                            .order(MirrorOrder::PublishedAtDesc),
                    )
                    .await?;
                Ok(rows.iter().map(MirrorRecord::to_record).collect())
            },
            move || async move {
                let mut records = self.source.list_all().await?;
                records.retain(Record::is_public);
                records.sort_by(|left, right| right.date.cmp(&left.date));
                Ok(records)
            },
        )
        .await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<ServiceResponse<Record>> {
        self.read(
            &CacheKey::record(id),
            "get record",
            move |mirror| async move {
                let row = mirror
                    .find_by_external_id(id)
                    .await?
                    .filter(|row| row.status == MirrorStatus::Published)
                    .ok_or_else(|| Error::NotFound(format!("record {id}")))?;
                Ok(row.to_record())
            },
            move || async move {
                let detail = self.source.get_detail(id).await?;
                visible(detail.record, id)
            },
        )
        .await
    }

    /// Metadata mirror-first by slug; the body always comes from the source
    pub async fn get_detail(&self, slug: &str) -> Result<ServiceResponse<RecordDetail>> {
        let key = CacheKey::detail(slug);
        if let Some(hit) = self.cached(&key) {
            return Ok(hit);
        }

        let config = self.config.snapshot();
        let (record, origin, fallback) = self
            .resolve(
                "get record by slug",
                &config,
                move |mirror| async move {
                    let row = mirror
                        .query(&MirrorQuery::new(MirrorFilter::Slug(slug.to_string())).limit(1))
                        .await?
                        .into_iter()
                        .find(|row| row.status == MirrorStatus::Published)
                        .ok_or_else(|| Error::NotFound(format!("record {slug}")))?;
                    Ok(row.to_record())
                },
                move || async move {
                    let record = self
                        .source
                        .list_all()
                        .await?
                        .into_iter()
                        .find(|record| record.slug == slug)
                        .ok_or_else(|| Error::NotFound(format!("record {slug}")))?;
                    visible(record, slug)
                },
            )
            .await?;

        let policy = RetryPolicy::from_config(&config);
        let body = with_retry(&policy, Origin::Source, "get record body", || {
            self.source.get_detail(&record.id)
        })
        .await
        .map_err(Error::Classified)?
        .body;
        Ok(self.remember(
            &key,
            RecordDetail { record, body },
            origin,
            fallback,
            &config,
        ))
    }

    /// Check both origins concurrently; healthy if either answers
    pub async fn health_check(&self) -> HealthReport {
        let timeout = self.config.snapshot().health_timeout();
        let mirror_check = async {
            match &self.mirror {
                Some(mirror) => check_origin(timeout, mirror.ping()).await,
                None => OriginHealth::disabled(),
            }
        };
        let source_check =
            check_origin(timeout, async { self.source.list_all().await.map(drop) });

        let (mirror, source) = tokio::join!(mirror_check, source_check);
        HealthReport {
            healthy: mirror.is_healthy() || source.is_healthy(),
            mirror,
            source,
            checked_at: Utc::now(),
        }
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.cache.invalidate(key)
    }

    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        self.cache.invalidate_prefix(prefix)
    }

    /// Drop the collection and every entry naming this record
    pub fn invalidate_record(&self, id: &str, slug: Option<&str>) -> usize {
        let mut removed = usize::from(self.cache.invalidate(CacheKey::COLLECTION));
        removed += usize::from(self.cache.invalidate(&CacheKey::record(id)));
        if let Some(slug) = slug {
            removed += usize::from(self.cache.invalidate(&CacheKey::detail(slug)));
        }
        removed
    }

    pub fn clear_cache(&self) -> usize {
        self.cache.clear()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn read<T, M, MF, S, SF>(
        &self,
        key: &str,
        label: &str,
        mirror_op: M,
        source_op: S,
    ) -> Result<ServiceResponse<T>>
    where
        T: Cacheable,
        M: Fn(Arc<dyn MirrorStore>) -> MF,
        MF: Future<Output = Result<T>>,
        S: Fn() -> SF,
        SF: Future<Output = Result<T>>,
    {
        if let Some(hit) = self.cached(key) {
            return Ok(hit);
        }
        let config = self.config.snapshot();
        let (data, origin, fallback) = self.resolve(label, &config, mirror_op, source_op).await?;
        Ok(self.remember(key, data, origin, fallback, &config))
    }

    fn cached<T: Cacheable>(&self, key: &str) -> Option<ServiceResponse<T>> {
        let (data, origin) = self.cache.get(key)?;
        Some(ServiceResponse {
            data: T::from_cached(data)?,
            origin,
            fallback: false,
            cached: true,
        })
    }

    /// Mirror with retry, then the source when the failure allows fallback
    async fn resolve<T, M, MF, S, SF>(
        &self,
        label: &str,
        config: &RuntimeConfig,
        mirror_op: M,
        source_op: S,
    ) -> Result<(T, Origin, bool)>
    where
        M: Fn(Arc<dyn MirrorStore>) -> MF,
        MF: Future<Output = Result<T>>,
        S: Fn() -> SF,
        SF: Future<Output = Result<T>>,
    {
        let policy = RetryPolicy::from_config(config);

        let Some(mirror) = self.mirror.clone() else {
            let data = with_retry(&policy, Origin::Source, label, &source_op)
                .await
                .map_err(Error::Classified)?;
            return Ok((data, Origin::Source, false));
        };

        let primary = match with_retry(&policy, Origin::Mirror, label, || {
            mirror_op(Arc::clone(&mirror))
        })
        .await
        {
            Ok(data) => return Ok((data, Origin::Mirror, false)),
            Err(primary) => primary,
        };

        if !should_fallback(
            primary.kind,
            config.fallback_enabled,
            config.fallback_conditions,
        ) {
            return Err(Error::Classified(primary));
        }
        tracing::warn!(
            operation = label,
            kind = primary.kind.label(),
            error = %primary,
            "Mirror read failed, falling back to source"
        );

        match with_retry(&policy, Origin::Source, label, &source_op).await {
            Ok(data) => Ok((data, Origin::Source, true)),
            Err(fallback) => Err(Error::BothOriginsFailed { primary, fallback }),
        }
    }

    fn remember<T: Cacheable>(
        &self,
        key: &str,
        data: T,
        origin: Origin,
        fallback: bool,
        config: &RuntimeConfig,
    ) -> ServiceResponse<T> {
        self.cache
            .insert(key, data.clone().into_cached(), origin, config.cache_ttl());
        ServiceResponse {
            data,
            origin,
            fallback,
            cached: false,
        }
    }
}

fn visible(record: Record, key: &str) -> Result<Record> {
    if record.status.is_visible_on_detail() {
        Ok(record)
    } else {
        Err(Error::NotFound(format!("record {key}")))
    }
}

async fn check_origin(
    timeout: Duration,
    check: impl Future<Output = Result<()>>,
) -> OriginHealth {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, check).await;
    let latency_ms = duration_millis(started.elapsed());
    match outcome {
        Ok(Ok(())) => OriginHealth {
            status: HealthState::Healthy,
            latency_ms,
            error: None,
        },
        Ok(Err(error)) => OriginHealth {
            status: HealthState::Unhealthy,
            latency_ms,
            error: Some(sanitize(&error)),
        },
        Err(_) => OriginHealth {
            status: HealthState::Unhealthy,
            latency_ms,
            error: Some(format!("timed out after {}ms", duration_millis(timeout))),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    use super::*;
    use crate::error::{SourceError, StoreError};
    use crate::models::{MirrorDraft, PublicationStatus};
    use crate::source::MemorySourceClient;
    use crate::store::MemoryMirrorStore;

    fn record(id: &str, status: PublicationStatus, age_days: i64) -> Record {
        let date = Utc::now() - TimeDelta::days(age_days);
        Record {
            id: id.to_string(),
            title: format!("Title {id}"),
            slug: format!("slug-{id}"),
            tags: BTreeSet::new(),
            category: None,
            summary: None,
            status,
            created_at: date,
            date,
            updated_at: date,
            thumbnail: None,
        }
    }

    fn row(record: &Record) -> MirrorRecord {
        MirrorRecord::from_draft(Uuid::now_v7(), MirrorDraft::from_record(record))
    }

    struct Fixture {
        source: Arc<MemorySourceClient>,
        store: MemoryMirrorStore,
        service: HybridAccessService,
    }

    fn fixture(records: Vec<Record>, config: RuntimeConfig) -> Fixture {
        let store = MemoryMirrorStore::new();
        for record in &records {
            store.seed(row(record));
        }
        let source = Arc::new(MemorySourceClient::with_records(records));
        let service = HybridAccessService::new(
            Some(Arc::new(store.read_only())),
            source.clone(),
            SharedConfig::new(config),
        );
        Fixture {
            source,
            store,
            service,
        }
    }

    fn quick_retries() -> RuntimeConfig {
        RuntimeConfig {
            max_retries: 2,
            retry_base_delay_ms: 10,
            max_retry_delay_ms: 20,
            ..RuntimeConfig::default()
        }
    }

    fn unavailable() -> StoreError {
        StoreError::Other("connection refused".to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn collection_from_mirror_is_published_newest_first() {
        let fx = fixture(
            vec![
                record("old", PublicationStatus::Public, 5),
                record("new", PublicationStatus::Public, 1),
                record("hidden", PublicationStatus::Private, 0),
                record("detail", PublicationStatus::PublicOnDetail, 0),
            ],
            quick_retries(),
        );

        let response = fx.service.get_collection().await.unwrap();
        assert_eq!(response.origin, Origin::Mirror);
        assert!(!response.fallback);
        let ids: Vec<&str> = response.data.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(fx.source.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_hit_touches_neither_origin() {
        let fx = fixture(vec![record("n1", PublicationStatus::Public, 1)], quick_retries());
        fx.service.get_collection().await.unwrap();
        let mirror_calls = fx.store.calls();

        tokio::time::advance(Duration::from_secs(60)).await;
        let cached = fx.service.get_collection().await.unwrap();
        assert!(cached.cached);
        assert_eq!(cached.origin, Origin::Mirror);
        assert_eq!(fx.store.calls(), mirror_calls);
        assert_eq!(fx.source.total_calls(), 0);

        tokio::time::advance(Duration::from_secs(300)).await;
        let refreshed = fx.service.get_collection().await.unwrap();
        assert!(!refreshed.cached);
        assert_eq!(fx.store.calls(), mirror_calls + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_mirror_falls_back_to_source() {
        let fx = fixture(
            vec![
                record("a", PublicationStatus::Public, 2),
                record("b", PublicationStatus::Public, 1),
                record("c", PublicationStatus::Private, 0),
            ],
            quick_retries(),
        );
        fx.store.fail_always(Some(unavailable()));

        let response = fx.service.get_collection().await.unwrap();
        assert_eq!(response.origin, Origin::Source);
        assert!(response.fallback);
        let ids: Vec<&str> = response.data.iter().map(|record| record.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(fx.store.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_mirror_row_falls_back_to_source() {
        let fx = fixture(Vec::new(), quick_retries());
        fx.source
            .upsert(record("late", PublicationStatus::Public, 0));

        let response = fx.service.get_by_id("late").await.unwrap();
        assert_eq!(response.origin, Origin::Source);
        assert!(response.fallback);
        // NotFound is not retried on the mirror
        assert_eq!(fx.store.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn authentication_failure_never_falls_back() {
        let fx = fixture(vec![record("n1", PublicationStatus::Public, 1)], quick_retries());
        fx.store
            .fail_always(Some(StoreError::PermissionDenied("jwt expired".to_string())));

        let err = fx.service.get_collection().await.unwrap_err();
        assert!(matches!(err, Error::Classified(ref classified) if classified.origin == Origin::Mirror));
        assert_eq!(fx.source.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_fallback_surfaces_primary_error() {
        let fx = fixture(
            vec![record("n1", PublicationStatus::Public, 1)],
            RuntimeConfig {
                fallback_enabled: false,
                ..quick_retries()
            },
        );
        fx.store.fail_always(Some(unavailable()));

        assert!(fx.service.get_collection().await.is_err());
        assert_eq!(fx.source.total_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn both_origins_failing_reports_both_messages() {
        let fx = fixture(vec![record("n1", PublicationStatus::Public, 1)], quick_retries());
        fx.store.fail_always(Some(unavailable()));
        fx.source.fail_always(Some(SourceError::Http {
            status: 503,
            retry_after_ms: None,
            message: "maintenance window".to_string(),
        }));

        let err = fx.service.get_collection().await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("connection refused"), "{message}");
        assert!(message.contains("maintenance window"), "{message}");
        assert!(matches!(err, Error::BothOriginsFailed { .. }));
        assert_eq!(fx.source.list_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn without_mirror_source_is_primary() {
        let source = Arc::new(MemorySourceClient::with_records(vec![record(
            "n1",
            PublicationStatus::Public,
            1,
        )]));
        let service =
            HybridAccessService::new(None, source.clone(), SharedConfig::new(quick_retries()));

        let response = service.get_collection().await.unwrap();
        assert_eq!(response.origin, Origin::Source);
        assert!(!response.fallback);
        assert!(!service.is_mirror_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn detail_combines_mirror_metadata_with_source_body() {
        let published = record("n1", PublicationStatus::Public, 1);
        let fx = fixture(vec![published.clone()], quick_retries());
        fx.source
            .set_body("n1", serde_json::json!({"blocks": ["hello"]}));

        let response = fx.service.get_detail(&published.slug).await.unwrap();
        assert_eq!(response.origin, Origin::Mirror);
        assert_eq!(response.data.record.id, "n1");
        assert_eq!(response.data.body, serde_json::json!({"blocks": ["hello"]}));
    }

    #[tokio::test(start_paused = true)]
    async fn detail_only_records_are_served_from_source() {
        let detail_only = record("n2", PublicationStatus::PublicOnDetail, 1);
        let fx = fixture(vec![detail_only.clone()], quick_retries());

        let response = fx.service.get_detail(&detail_only.slug).await.unwrap();
        assert_eq!(response.origin, Origin::Source);
        assert_eq!(
            response.data.record.status,
            PublicationStatus::PublicOnDetail
        );
    }

    #[tokio::test(start_paused = true)]
    async fn detail_fallback_resolves_slug_to_source_id() {
        let fx = fixture(Vec::new(), quick_retries());
        let late = record("n7", PublicationStatus::Public, 0);
        fx.source.upsert(late.clone());
        fx.source.set_body("n7", serde_json::json!({"blocks": ["late"]}));

        let response = fx.service.get_detail(&late.slug).await.unwrap();
        assert_eq!(response.origin, Origin::Source);
        assert!(response.fallback);
        assert_eq!(response.data.record.id, "n7");
        assert_eq!(response.data.body, serde_json::json!({"blocks": ["late"]}));
        assert_eq!(fx.source.list_calls(), 1);
        assert_eq!(fx.source.detail_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn detail_body_failure_is_reported_against_the_source() {
        let published = record("n1", PublicationStatus::Public, 1);
        let fx = fixture(vec![published.clone()], quick_retries());
        fx.source.fail_always(Some(SourceError::Http {
            status: 503,
            retry_after_ms: None,
            message: "maintenance window".to_string(),
        }));

        let err = fx.service.get_detail(&published.slug).await.unwrap_err();
        assert!(matches!(err, Error::Classified(ref classified) if classified.origin == Origin::Source));
        assert_eq!(fx.store.calls(), 1);
        assert_eq!(fx.source.detail_calls(), 2);
        assert_eq!(fx.source.list_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidation_forces_refetch() {
        let published = record("n1", PublicationStatus::Public, 1);
        let fx = fixture(vec![published.clone()], quick_retries());
        fx.service.get_collection().await.unwrap();
        fx.service.get_by_id("n1").await.unwrap();
        assert_eq!(fx.service.cache_stats().entries, 2);

        assert_eq!(fx.service.invalidate_record("n1", Some(&published.slug)), 2);
        assert_eq!(fx.service.cache_stats().entries, 0);

        fx.service.get_collection().await.unwrap();
        assert_eq!(fx.service.invalidate_prefix(CacheKey::PREFIX), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn health_is_ok_when_one_origin_answers() {
        let fx = fixture(vec![record("n1", PublicationStatus::Public, 1)], quick_retries());
        fx.store.fail_always(Some(unavailable()));

        let report = fx.service.health_check().await;
        assert!(report.healthy);
        assert_eq!(report.mirror.status, HealthState::Unhealthy);
        assert!(report.mirror.error.is_some());
        assert_eq!(report.source.status, HealthState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn health_check_times_out_slow_origin() {
        let fx = fixture(
            Vec::new(),
            RuntimeConfig {
                health_timeout_ms: 100,
                ..quick_retries()
            },
        );
        fx.store.set_latency(Some(Duration::from_secs(5)));
        fx.source.fail_always(Some(SourceError::Network("down".to_string())));

        let report = fx.service.health_check().await;
        assert!(!report.healthy);
        assert_eq!(
            report.mirror.error.as_deref(),
            Some("timed out after 100ms")
        );
        assert_eq!(report.source.status, HealthState::Unhealthy);
    }
}
