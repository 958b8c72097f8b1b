//! Database connection management

use std::fmt;
use std::path::Path;

use libsql::{Builder, Connection, Database as LibSqlDatabase};

use super::migrations;
use crate::error::Result;

/// Connection details for a remote libSQL mirror
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    /// Remote database URL (e.g., `libsql://mirror.turso.io`)
    pub url: String,
    /// Authentication token with write access
    pub auth_token: String,
}

impl RemoteConfig {
    pub fn new(url: impl Into<String>, auth_token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_token: auth_token.into(),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RemoteConfig")
            .field("url", &self.url)
            .field("auth_token", &"[REDACTED]")
            .finish()
    }
}

/// Database wrapper for libSQL connections
pub struct Database {
    _db: LibSqlDatabase,
    conn: Connection,
    remote: bool,
}

impl Database {
    /// Open a local database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = Builder::new_local(&path_str).build().await?;
        Self::initialize(db, false).await
    }

    /// Open an in-memory database (useful for testing)
    pub async fn open_in_memory() -> Result<Self> {
        let db = Builder::new_local(":memory:").build().await?;
        Self::initialize(db, false).await
    }

    /// Connect to a remote libSQL server holding the mirror
    pub async fn open_remote(config: &RemoteConfig) -> Result<Self> {
        let db = Builder::new_remote(config.url.clone(), config.auth_token.clone())
            .build()
            .await?;
        tracing::info!(url = %config.url, "Connected to remote mirror database");
        Self::initialize(db, true).await
    }

    async fn initialize(db: LibSqlDatabase, remote: bool) -> Result<Self> {
        let conn = db.connect()?;
        let database = Self {
            _db: db,
            conn,
            remote,
        };
        database.configure().await;
        database.migrate().await?;
        Ok(database)
    }

    /// Configure `SQLite` pragmas; remote servers may reject them
    async fn configure(&self) {
        if self.remote {
            return;
        }
        self.conn
            .execute("PRAGMA journal_mode = WAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA synchronous = NORMAL;", ())
            .await
            .ok();
        self.conn
            .execute("PRAGMA cache_size = 10000;", ())
            .await
            .ok();
    }

    /// Run database migrations
    async fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn).await
    }

    pub const fn is_remote(&self) -> bool {
        self.remote
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_open_in_memory() {
        let db = Database::open_in_memory().await.unwrap();
        assert!(!db.is_remote());

        let mut rows = db
            .connection()
            .query("SELECT COUNT(*) FROM records", ())
            .await
            .expect("records table should exist");
        let row = rows.next().await.unwrap().unwrap();
        let count: i64 = row.get(0).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn remote_config_redacts_token() {
        let config = RemoteConfig::new("libsql://mirror.turso.io", "secret-token");
        let debug = format!("{config:?}");
        assert!(debug.contains("libsql://mirror.turso.io"));
        assert!(!debug.contains("secret-token"));
    }
}
