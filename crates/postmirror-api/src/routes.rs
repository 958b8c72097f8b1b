use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use postmirror_core::cache::CacheStats;
use postmirror_core::models::{
    SyncProgress, SyncStats, WebhookEvent, WebhookPayload,
};
use postmirror_core::{
    HealthReport, HttpSourceClient, HybridAccessService, LibSqlMirrorStore, MirrorStore, Record,
    RecordDetail, ServiceResponse, SharedConfig, SourceClient, SyncBatch, SyncRun, SyncRunStore,
    SyncService, WebhookOutcome,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{optional_api_secret, require_api_secret, require_webhook_secret};
use crate::config::AppConfig;
use crate::error::AppError;

pub const WEBHOOK_BODY_LIMIT: usize = 1024 * 1024;
const STATUS_RECENT_RUNS: usize = 5;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sync: Arc<SyncService>,
    pub hybrid: Arc<HybridAccessService>,
}

impl AppState {
    /// Open the mirror and the source client described by `config`
    pub async fn from_config(config: Arc<AppConfig>) -> postmirror_core::Result<Self> {
        let source: Arc<dyn SourceClient> = Arc::new(HttpSourceClient::new(
            config.source_api_url.clone(),
            config.source_api_token.clone(),
        )?);
        let store = match &config.mirror_remote {
            Some(remote) => LibSqlMirrorStore::open_remote(remote).await?,
            None => LibSqlMirrorStore::open_path(&config.mirror_database_path).await?,
        };
        let reader: Option<Arc<dyn MirrorStore>> = if config.mirror_enabled {
            Some(Arc::new(store.read_only()))
        } else {
            None
        };
        let store = Arc::new(store);
        Ok(Self::from_parts(
            config,
            source,
            store.clone(),
            reader,
            store,
        ))
    }

    /// `store` is the service-role handle; `reader` serves hybrid reads
    pub fn from_parts(
        config: Arc<AppConfig>,
        source: Arc<dyn SourceClient>,
        store: Arc<dyn MirrorStore>,
        reader: Option<Arc<dyn MirrorStore>>,
        runs: Arc<dyn SyncRunStore>,
    ) -> Self {
        let runtime = SharedConfig::new(config.runtime.clone());
        let hybrid = Arc::new(HybridAccessService::new(
            reader,
            Arc::clone(&source),
            runtime.clone(),
        ));
        let sync = Arc::new(
            SyncService::new(source, store, runs, runtime).with_hybrid(Arc::clone(&hybrid)),
        );
        Self {
            config,
            sync,
            hybrid,
        }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/manual", post(manual_sync))
        .route("/cache/revalidate", post(revalidate_cache))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_sync_secret,
        ));

    let api_routes = Router::new()
        .route("/sync/status", get(sync_status))
        .route(
            "/sync/webhook",
            post(sync_webhook).layer(DefaultBodyLimit::max(WEBHOOK_BODY_LIMIT)),
        )
        .merge(protected_routes);

    let record_routes = Router::new()
        .route("/records", get(list_records))
        .route("/records/{id}", get(get_record))
        .route("/records/by-slug/{slug}", get(get_record_by_slug));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/api", api_routes)
        .nest("/v1", record_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let report = state.hybrid.health_check().await;
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn require_sync_secret(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    require_api_secret(request.headers(), state.config.sync_api_secret.as_deref())?;
    Ok(next.run(request).await)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ManualSyncType {
    /// Clear and rewrite the mirror
    Full,
    #[default]
    Incremental,
    Specific,
}

#[derive(Debug, Deserialize)]
struct ManualSyncRequest {
    #[serde(rename = "type", default)]
    sync_type: ManualSyncType,
    #[serde(default)]
    ids: Vec<String>,
}

#[derive(Debug, Serialize)]
struct ManualSyncResponse {
    success: bool,
    #[serde(rename = "type")]
    sync_type: ManualSyncType,
    batch: SyncBatch,
}

/// Runs a full migration, an incremental sync or a sync of specific ids.
/// A missing `type` runs an incremental sync.
async fn manual_sync(
    State(state): State<AppState>,
    payload: Result<Json<ManualSyncRequest>, JsonRejection>,
) -> Result<Json<ManualSyncResponse>, AppError> {
    let Json(request) = payload?;
    let batch = match request.sync_type {
        ManualSyncType::Full => state.sync.initial_migration().await?,
        ManualSyncType::Incremental => state.sync.incremental_sync().await?,
        ManualSyncType::Specific => {
            let ids: Vec<String> = request
                .ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            if ids.is_empty() {
                return Err(AppError::bad_request(
                    "`ids` must be a non-empty list for specific syncs",
                ));
            }
            state.sync.sync_all(Some(&ids)).await?
        }
    };

    tracing::info!(
        endpoint = "sync_manual",
        sync_type = ?request.sync_type,
        batch_id = %batch.id,
        success = batch.success,
        failed = batch.failed,
        "Manual sync finished"
    );
    Ok(Json(ManualSyncResponse {
        success: batch.failed == 0,
        sync_type: request.sync_type,
        batch,
    }))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    batch_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    running: bool,
    stats: SyncStats,
    recent_runs: Vec<SyncRun>,
    active: Vec<SyncProgress>,
    recent_batches: Vec<SyncBatch>,
    timestamp: i64,
}

async fn sync_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StatusQuery>,
) -> Result<Response, AppError> {
    optional_api_secret(&headers, state.config.sync_api_secret.as_deref())?;

    if let Some(batch_id) = query.batch_id {
        let progress = state
            .sync
            .progress(batch_id)
            .ok_or_else(|| AppError::not_found(format!("batch {batch_id}")))?;
        return Ok(Json(progress).into_response());
    }

    let response = StatusResponse {
        running: state.sync.is_running(),
        stats: state.sync.get_sync_stats().await,
        recent_runs: state.sync.sync_history(Some(STATUS_RECENT_RUNS)).await?,
        active: state.sync.active_progress(),
        recent_batches: state.sync.recent_batches(),
        timestamp: Utc::now().timestamp(),
    };
    Ok(Json(response).into_response())
}

#[derive(Debug, Serialize)]
struct WebhookResponse {
    success: bool,
    event: WebhookEvent,
    external_id: String,
    result: WebhookOutcome,
}

async fn sync_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<WebhookPayload>, JsonRejection>,
) -> Result<Json<WebhookResponse>, AppError> {
    require_webhook_secret(&headers, state.config.sync_webhook_secret.as_deref())?;
    let Json(payload) = payload?;

    let result = state.sync.handle_webhook(&payload).await?;
    Ok(Json(WebhookResponse {
        success: true,
        event: payload.event,
        external_id: payload.external_id,
        result,
    }))
}

async fn list_records(
    State(state): State<AppState>,
) -> Result<Json<ServiceResponse<Vec<Record>>>, AppError> {
    Ok(Json(state.hybrid.get_collection().await?))
}

async fn get_record(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ServiceResponse<Record>>, AppError> {
    Ok(Json(state.hybrid.get_by_id(&id).await?))
}

async fn get_record_by_slug(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<ServiceResponse<RecordDetail>>, AppError> {
    Ok(Json(state.hybrid.get_detail(&slug).await?))
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RevalidateRequest {
    key: Option<String>,
    prefix: Option<String>,
}

#[derive(Debug, Serialize)]
struct RevalidateResponse {
    cleared: usize,
    cache: CacheStats,
}

async fn revalidate_cache(
    State(state): State<AppState>,
    payload: Result<Json<RevalidateRequest>, JsonRejection>,
) -> Result<Json<RevalidateResponse>, AppError> {
    let Json(request) = payload?;
    let cleared = match (request.key.as_deref(), request.prefix.as_deref()) {
        (None, None) => state.hybrid.clear_cache(),
        (key, prefix) => {
            let by_key = key.map_or(0, |key| usize::from(state.hybrid.invalidate(key)));
            let by_prefix = prefix.map_or(0, |prefix| state.hybrid.invalidate_prefix(prefix));
            by_key + by_prefix
        }
    };
    tracing::info!(endpoint = "cache_revalidate", cleared, "Revalidated read cache");
    Ok(Json(RevalidateResponse {
        cleared,
        cache: state.hybrid.cache_stats(),
    }))
}
