use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use postmirror_core::config::{optional_trimmed, required_trimmed, ConfigError};
use postmirror_core::hybrid::HealthState;
use postmirror_core::models::SyncStats;
use postmirror_core::{
    HealthReport, HttpSourceClient, HybridAccessService, LibSqlMirrorStore, MirrorStore,
    OriginHealth, RemoteConfig, RuntimeConfig, SharedConfig, SourceClient, SyncBatch, SyncRun,
    SyncRunStore, SyncService, TimestampTracker,
};

use crate::error::CliError;

/// Environment shared with the API binary
#[derive(Debug, Clone, Default)]
pub struct CliEnv {
    pub source_api_url: Option<String>,
    pub source_api_token: Option<String>,
    pub mirror_database_path: Option<PathBuf>,
    pub mirror_remote: Option<RemoteConfig>,
    pub runtime: RuntimeConfig,
}

impl CliEnv {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mirror_remote = match optional_trimmed(&lookup, "MIRROR_DATABASE_URL") {
            Some(url) => Some(RemoteConfig::new(
                url,
                required_trimmed(&lookup, "MIRROR_AUTH_TOKEN")?,
            )),
            None => None,
        };
        Ok(Self {
            source_api_url: optional_trimmed(&lookup, "SOURCE_API_URL"),
            source_api_token: optional_trimmed(&lookup, "SOURCE_API_TOKEN"),
            mirror_database_path: optional_trimmed(&lookup, "MIRROR_DATABASE_PATH")
                .map(PathBuf::from),
            mirror_remote,
            runtime: RuntimeConfig::from_lookup(&lookup)?,
        })
    }

    fn source_client(&self) -> Result<HttpSourceClient, CliError> {
        let url = self.source_api_url.as_deref().ok_or_else(|| {
            CliError::Config("SOURCE_API_URL must be set for this command".to_string())
        })?;
        Ok(HttpSourceClient::new(url, self.source_api_token.clone())?)
    }
}

/// `--db-path`, then `MIRROR_DATABASE_PATH`, then the per-user data directory
pub fn resolve_db_path(cli_db_path: Option<PathBuf>, env: &CliEnv) -> PathBuf {
    cli_db_path
        .or_else(|| env.mirror_database_path.clone())
        .unwrap_or_else(default_db_path)
}

pub fn default_db_path() -> PathBuf {
    dirs::data_dir().map_or_else(
        || PathBuf::from("postmirror.db"),
        |dir| dir.join("postmirror").join("postmirror.db"),
    )
}

pub async fn open_store(db_path: &Path, env: &CliEnv) -> Result<LibSqlMirrorStore, CliError> {
    let store = match &env.mirror_remote {
        Some(remote) => LibSqlMirrorStore::open_remote(remote).await?,
        None => LibSqlMirrorStore::open_path(db_path).await?,
    };
    Ok(store)
}

pub async fn open_tracker(db_path: &Path, env: &CliEnv) -> Result<TimestampTracker, CliError> {
    let store = Arc::new(open_store(db_path, env).await?);
    Ok(TimestampTracker::new(store.clone(), store))
}

/// Sync and read services over one mirror
pub struct Services {
    pub sync: SyncService,
    pub hybrid: Arc<HybridAccessService>,
}

impl Services {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<dyn MirrorStore>,
        reader: Arc<dyn MirrorStore>,
        runs: Arc<dyn SyncRunStore>,
        runtime: RuntimeConfig,
    ) -> Self {
        let config = SharedConfig::new(runtime);
        let hybrid = Arc::new(HybridAccessService::new(
            Some(reader),
            Arc::clone(&source),
            config.clone(),
        ));
        let sync = SyncService::new(source, store, runs, config).with_hybrid(Arc::clone(&hybrid));
        Self { sync, hybrid }
    }

    pub async fn open(db_path: &Path, env: &CliEnv) -> Result<Self, CliError> {
        let source: Arc<dyn SourceClient> = Arc::new(env.source_client()?);
        let store = open_store(db_path, env).await?;
        let reader: Arc<dyn MirrorStore> = Arc::new(store.read_only());
        let store = Arc::new(store);
        Ok(Self::new(
            source,
            store.clone(),
            reader,
            store,
            env.runtime.clone(),
        ))
    }
}

pub fn format_timestamp(value: DateTime<Utc>) -> String {
    value.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

pub fn format_batch_lines(batch: &SyncBatch) -> Vec<String> {
    let mut lines = vec![format!(
        "{} sync: {} synced, {} failed, {} skipped of {} records",
        batch.kind.as_str(),
        batch.success,
        batch.failed,
        batch.skipped,
        batch.total
    )];
    lines.extend(
        batch
            .warnings
            .iter()
            .map(|warning| format!("  warning: {warning}")),
    );
    lines.extend(batch.errors.iter().map(|error| format!("  error: {error}")));
    lines
}

pub fn format_run_lines(runs: &[SyncRun]) -> Vec<String> {
    runs.iter()
        .map(|run| {
            let mut line = format!(
                "{}  {:<11}  {:<9}  {}  {} records",
                run.id,
                run.kind.as_str(),
                run.status.as_str(),
                format_timestamp(run.started_at),
                run.records_synced
            );
            if let Some(error) = &run.error {
                line.push_str("  ");
                line.push_str(error);
            }
            line
        })
        .collect()
}

pub fn format_stats_lines(stats: &SyncStats) -> Vec<String> {
    let mut lines = vec![
        format!("Source records:  {}", stats.total_records),
        format!("Mirrored:        {}", stats.synced_records),
        format!("Pending:         {}", stats.pending_records),
        format!("Failed (last):   {}", stats.failed_records),
        format!(
            "Last sync:       {}",
            stats
                .last_sync_time
                .map_or_else(|| "never".to_string(), format_timestamp)
        ),
    ];
    lines.extend(stats.errors.iter().map(|error| format!("  error: {error}")));
    lines
}

pub fn format_health_lines(report: &HealthReport) -> Vec<String> {
    vec![
        format!(
            "Overall: {}",
            if report.healthy { "healthy" } else { "unhealthy" }
        ),
        format_origin_health("Mirror", &report.mirror),
        format_origin_health("Source", &report.source),
    ]
}

fn format_origin_health(name: &str, health: &OriginHealth) -> String {
    let status = match health.status {
        HealthState::Healthy => "healthy",
        HealthState::Unhealthy => "unhealthy",
        HealthState::Disabled => return format!("{name}: disabled"),
    };
    match &health.error {
        Some(error) => format!("{name}: {status} ({} ms): {error}", health.latency_ms),
        None => format!("{name}: {status} ({} ms)", health.latency_ms),
    }
}
