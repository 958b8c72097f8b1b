//! libSQL implementation of the mirror and run stores

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Row, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Database, RemoteConfig};
use crate::error::{Error, Result, StoreError};
use crate::models::{MirrorDraft, MirrorRecord, SyncRun};
use crate::store::{MirrorFilter, MirrorOrder, MirrorQuery, MirrorStore, StoreRole, SyncRunStore};

const RECORD_COLUMNS: &str = "id, external_id, title, slug, content, status, published_at, \
     created_at, updated_at, tags, category, summary, cover_image";

const RUN_COLUMNS: &str =
    "id, kind, direction, started_at, completed_at, records_synced, status, error";

/// Mirror store over a libSQL database (local file, in-memory, or remote)
#[derive(Clone)]
pub struct LibSqlMirrorStore {
    db: Arc<Mutex<Database>>,
    role: StoreRole,
}

impl LibSqlMirrorStore {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
            role: StoreRole::Service,
        }
    }

    pub async fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self::new(Database::open(path).await?))
    }

    pub async fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory().await?))
    }

    pub async fn open_remote(config: &RemoteConfig) -> Result<Self> {
        Ok(Self::new(Database::open_remote(config).await?))
    }

    /// Read-only handle over the same database
    #[must_use]
    pub fn read_only(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            role: StoreRole::ReadOnly,
        }
    }
}

#[async_trait]
impl MirrorStore for LibSqlMirrorStore {
    fn role(&self) -> StoreRole {
        self.role
    }

    async fn query(&self, query: &MirrorQuery) -> Result<Vec<MirrorRecord>> {
        let (where_sql, mut params) = where_clause(&query.filter);
        let mut sql = format!("SELECT {RECORD_COLUMNS} FROM records{where_sql}");
        match query.order {
            Some(MirrorOrder::PublishedAtDesc) => {
                sql.push_str(" ORDER BY published_at IS NULL, published_at DESC, created_at DESC");
            }
            Some(MirrorOrder::UpdatedAtDesc) => sql.push_str(" ORDER BY updated_at DESC"),
            None => {}
        }
        if query.limit.is_some() || query.offset > 0 {
            sql.push_str(" LIMIT ? OFFSET ?");
            params.push(Value::Integer(
                query.limit.map_or(-1, |limit| to_i64(limit)),
            ));
            params.push(Value::Integer(to_i64(query.offset)));
        }

        let db = self.db.lock().await;
        let mut rows = db.connection().query(&sql, params).await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(parse_record(&row)?);
        }
        Ok(records)
    }

    async fn insert(&self, draft: &MirrorDraft) -> Result<MirrorRecord> {
        self.role.ensure_writable()?;
        let id = Uuid::now_v7();
        let mut params = vec![Value::Text(id.to_string())];
        params.extend(draft_values(draft)?);

        let db = self.db.lock().await;
        db.connection()
            .execute(
                &format!(
                    "INSERT INTO records ({RECORD_COLUMNS}) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params,
            )
            .await
            .map_err(|error| map_write_error(error, draft))?;
        Ok(MirrorRecord::from_draft(id, draft.clone()))
    }

    async fn update_by_filter(&self, filter: &MirrorFilter, draft: &MirrorDraft) -> Result<u64> {
        self.role.ensure_writable()?;
        let (where_sql, where_params) = where_clause(filter);
        let mut params = draft_values(draft)?;
        params.extend(where_params);

        let db = self.db.lock().await;
        let updated = db
            .connection()
            .execute(
                &format!(
                    "UPDATE records SET external_id = ?, title = ?, slug = ?, content = ?, \
                     status = ?, published_at = ?, created_at = ?, updated_at = ?, tags = ?, \
                     category = ?, summary = ?, cover_image = ?{where_sql}"
                ),
                params,
            )
            .await
            .map_err(|error| map_write_error(error, draft))?;
        if updated == 0 {
            return Err(StoreError::NotFound(format!("no row matches {filter:?}")).into());
        }
        Ok(updated)
    }

    async fn delete_by_filter(&self, filter: &MirrorFilter) -> Result<u64> {
        self.role.ensure_writable()?;
        let (where_sql, params) = where_clause(filter);
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute(&format!("DELETE FROM records{where_sql}"), params)
            .await?;
        Ok(removed)
    }

    async fn ping(&self) -> Result<()> {
        let db = self.db.lock().await;
        let mut rows = db.connection().query("SELECT 1", ()).await?;
        rows.next().await?;
        Ok(())
    }

    async fn count(&self, filter: &MirrorFilter) -> Result<usize> {
        let (where_sql, params) = where_clause(filter);
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(&format!("SELECT COUNT(*) FROM records{where_sql}"), params)
            .await?;
        let count = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?,
            None => 0,
        };
        Ok(usize::try_from(count).unwrap_or_default())
    }
}

#[async_trait]
impl SyncRunStore for LibSqlMirrorStore {
    async fn save_run(&self, run: &SyncRun) -> Result<()> {
        let params = vec![
            Value::Text(run.id.to_string()),
            Value::Text(run.kind.as_str().to_string()),
            Value::Text(run.direction.as_str().to_string()),
            Value::Integer(run.started_at.timestamp_millis()),
            optional_millis(run.completed_at),
            Value::Integer(i64::try_from(run.records_synced).unwrap_or(i64::MAX)),
            Value::Text(run.status.as_str().to_string()),
            run.error.clone().map_or(Value::Null, Value::Text),
        ];
        let db = self.db.lock().await;
        db.connection()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO sync_runs ({RUN_COLUMNS}) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
                ),
                params,
            )
            .await?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE id = ?"),
                libsql::params![id.to_string()],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(parse_run(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_runs(&self, limit: Option<usize>) -> Result<Vec<SyncRun>> {
        let limit = limit.map_or(-1, to_i64);
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM sync_runs \
                     ORDER BY started_at DESC, id DESC LIMIT ?"
                ),
                libsql::params![limit],
            )
            .await?;
        let mut runs = Vec::new();
        while let Some(row) = rows.next().await? {
            runs.push(parse_run(&row)?);
        }
        Ok(runs)
    }

    async fn delete_runs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let db = self.db.lock().await;
        let removed = db
            .connection()
            .execute(
                "DELETE FROM sync_runs WHERE started_at < ?",
                libsql::params![cutoff.timestamp_millis()],
            )
            .await?;
        Ok(removed)
    }
}

fn where_clause(filter: &MirrorFilter) -> (String, Vec<Value>) {
    match filter {
        MirrorFilter::All => (String::new(), Vec::new()),
        MirrorFilter::ExternalId(id) => (
            " WHERE external_id = ?".to_string(),
            vec![Value::Text(id.clone())],
        ),
        MirrorFilter::ExternalIds(ids) if ids.is_empty() => (" WHERE 0".to_string(), Vec::new()),
        MirrorFilter::ExternalIds(ids) => {
            let placeholders = vec!["?"; ids.len()].join(", ");
            (
                format!(" WHERE external_id IN ({placeholders})"),
                ids.iter().cloned().map(Value::Text).collect(),
            )
        }
        MirrorFilter::Slug(slug) => (" WHERE slug = ?".to_string(), vec![Value::Text(slug.clone())]),
        MirrorFilter::Status(status) => (
            " WHERE status = ?".to_string(),
            vec![Value::Text(status.as_str().to_string())],
        ),
        MirrorFilter::UpdatedAfter(since) => (
            " WHERE updated_at > ?".to_string(),
            vec![Value::Integer(since.timestamp_millis())],
        ),
    }
}

/// Column values in `RECORD_COLUMNS` order, without the surrogate id
fn draft_values(draft: &MirrorDraft) -> Result<Vec<Value>> {
    let content = match &draft.content {
        Some(value) => Value::Text(serde_json::to_string(value)?),
        None => Value::Null,
    };
    Ok(vec![
        Value::Text(draft.external_id.clone()),
        Value::Text(draft.title.clone()),
        Value::Text(draft.slug.clone()),
        content,
        Value::Text(draft.status.as_str().to_string()),
        optional_millis(draft.published_at),
        Value::Integer(draft.created_at.timestamp_millis()),
        Value::Integer(draft.updated_at.timestamp_millis()),
        Value::Text(serde_json::to_string(&draft.tags)?),
        draft.category.clone().map_or(Value::Null, Value::Text),
        draft.summary.clone().map_or(Value::Null, Value::Text),
        draft.cover_image.clone().map_or(Value::Null, Value::Text),
    ])
}

fn map_write_error(error: libsql::Error, draft: &MirrorDraft) -> Error {
    let message = error.to_string();
    if !message.contains("UNIQUE constraint failed") {
        return Error::LibSql(error);
    }
    let (field, value) = if message.contains("records.slug") {
        ("slug", draft.slug.clone())
    } else {
        ("external_id", draft.external_id.clone())
    };
    StoreError::UniqueViolation {
        field: field.to_string(),
        value,
    }
    .into()
}

fn parse_record(row: &Row) -> Result<MirrorRecord> {
    let id = required_text(row, 0)?;
    let content = optional_text(row, 4)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()?;
    let status = required_text(row, 5)?;
    let tags: BTreeSet<String> = serde_json::from_str(&required_text(row, 9)?)?;

    Ok(MirrorRecord {
        id: parse_uuid(&id)?,
        external_id: required_text(row, 1)?,
        title: required_text(row, 2)?,
        slug: required_text(row, 3)?,
        content,
        status: status.parse().map_err(corrupt)?,
        published_at: optional_integer(row, 6)?.map(from_millis).transpose()?,
        created_at: from_millis(required_integer(row, 7)?)?,
        updated_at: from_millis(required_integer(row, 8)?)?,
        tags,
        category: optional_text(row, 10)?,
        summary: optional_text(row, 11)?,
        cover_image: optional_text(row, 12)?,
    })
}

fn parse_run(row: &Row) -> Result<SyncRun> {
    Ok(SyncRun {
        id: parse_uuid(&required_text(row, 0)?)?,
        kind: required_text(row, 1)?.parse().map_err(corrupt)?,
        direction: required_text(row, 2)?.parse().map_err(corrupt)?,
        started_at: from_millis(required_integer(row, 3)?)?,
        completed_at: optional_integer(row, 4)?.map(from_millis).transpose()?,
        records_synced: u64::try_from(required_integer(row, 5)?).unwrap_or_default(),
        status: required_text(row, 6)?.parse().map_err(corrupt)?,
        error: optional_text(row, 7)?,
    })
}

fn optional_text(row: &Row, index: i32) -> Result<Option<String>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Text(value) => Ok(Some(value)),
        other => Err(corrupt(format!("column {index}: expected text, got {other:?}"))),
    }
}

fn required_text(row: &Row, index: i32) -> Result<String> {
    optional_text(row, index)?.ok_or_else(|| corrupt(format!("column {index} is NULL")))
}

fn optional_integer(row: &Row, index: i32) -> Result<Option<i64>> {
    match row.get_value(index)? {
        Value::Null => Ok(None),
        Value::Integer(value) => Ok(Some(value)),
        other => Err(corrupt(format!(
            "column {index}: expected integer, got {other:?}"
        ))),
    }
}

fn required_integer(row: &Row, index: i32) -> Result<i64> {
    optional_integer(row, index)?.ok_or_else(|| corrupt(format!("column {index} is NULL")))
}

fn optional_millis(value: Option<DateTime<Utc>>) -> Value {
    value.map_or(Value::Null, |time| Value::Integer(time.timestamp_millis()))
}

fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| corrupt(format!("timestamp out of range: {millis}")))
}

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|error| corrupt(format!("invalid id {value}: {error}")))
}

fn corrupt(message: impl Into<String>) -> Error {
    StoreError::Other(format!("corrupt mirror row: {}", message.into())).into()
}

fn to_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::models::{MirrorStatus, RunKind, SyncDirection};

    fn draft(external_id: &str, slug: &str, status: MirrorStatus) -> MirrorDraft {
        let now = DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap();
        MirrorDraft {
            external_id: external_id.to_string(),
            title: format!("Title {external_id}"),
            slug: slug.to_string(),
            content: Some(serde_json::json!({"id": external_id})),
            status,
            published_at: (status == MirrorStatus::Published).then_some(now),
            created_at: now,
            updated_at: now,
            tags: BTreeSet::from(["rust".to_string(), "sync".to_string()]),
            category: Some("dev".to_string()),
            summary: None,
            cover_image: None,
        }
    }

    async fn setup() -> LibSqlMirrorStore {
        LibSqlMirrorStore::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn insert_and_query_round_trip_columns() {
        let store = setup().await;
        let inserted = store
            .insert(&draft("n1", "hello", MirrorStatus::Published))
            .await
            .unwrap();

        let found = store.find_by_external_id("n1").await.unwrap().unwrap();
        assert_eq!(found, inserted);
        assert_eq!(store.count(&MirrorFilter::All).await.unwrap(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unique_constraints_surface_structured_codes() {
        let store = setup().await;
        store
            .insert(&draft("n1", "hello", MirrorStatus::Published))
            .await
            .unwrap();

        let err = store
            .insert(&draft("n2", "hello", MirrorStatus::Draft))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::UniqueViolation { ref field, .. }) if field == "slug"
        ));

        let err = store
            .insert(&draft("n1", "other", MirrorStatus::Draft))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Store(StoreError::UniqueViolation { ref field, .. }) if field == "external_id"
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn update_and_delete_by_filter() {
        let store = setup().await;
        store
            .insert(&draft("n1", "hello", MirrorStatus::Draft))
            .await
            .unwrap();

        let mut changed = draft("n1", "hello", MirrorStatus::Published);
        changed.title = "Changed".to_string();
        let updated = store
            .update_by_filter(&MirrorFilter::ExternalId("n1".into()), &changed)
            .await
            .unwrap();
        assert_eq!(updated, 1);
        assert_eq!(
            store.find_by_external_id("n1").await.unwrap().unwrap().title,
            "Changed"
        );

        let missing = store
            .update_by_filter(&MirrorFilter::ExternalId("nope".into()), &changed)
            .await
            .unwrap_err();
        assert!(matches!(missing, Error::Store(StoreError::NotFound(_))));

        let removed = store
            .delete_by_filter(&MirrorFilter::ExternalId("n1".into()))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(&MirrorFilter::All).await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn published_query_orders_newest_first() {
        let store = setup().await;
        let mut older = draft("n1", "older", MirrorStatus::Published);
        older.published_at = older.published_at.map(|time| time - TimeDelta::days(2));
        store.insert(&older).await.unwrap();
        store
            .insert(&draft("n2", "newer", MirrorStatus::Published))
            .await
            .unwrap();
        store
            .insert(&draft("n3", "hidden", MirrorStatus::Draft))
            .await
            .unwrap();

        let rows = store
            .query(
                &MirrorQuery::new(MirrorFilter::Status(MirrorStatus::Published))
                    .order(MirrorOrder::PublishedAtDesc),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|row| row.external_id.as_str()).collect();
        assert_eq!(ids, vec!["n2", "n1"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn read_only_handle_rejects_writes() {
        let store = setup().await;
        let reader = store.read_only();
        let err = reader
            .insert(&draft("n1", "hello", MirrorStatus::Draft))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Store(StoreError::PermissionDenied(_))));
        assert!(reader.ping().await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_runs_persist_across_handles() {
        let store = setup().await;
        let mut run = SyncRun::start(RunKind::Full, SyncDirection::SourceToMirror);
        run.started_at = DateTime::from_timestamp_millis(run.started_at.timestamp_millis()).unwrap();
        store.save_run(&run).await.unwrap();

        run.finish(4, true, None);
        run.completed_at = run
            .completed_at
            .and_then(|time| DateTime::from_timestamp_millis(time.timestamp_millis()));
        store.read_only().save_run(&run).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded, run);
        assert_eq!(store.list_runs(None).await.unwrap().len(), 1);
    }
}
