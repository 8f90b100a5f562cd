//! Outcome store -- ongoing runs in memory, terminal runs in SQLite.

pub mod runs;
pub mod schema;

use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use self::runs::SqliteStore;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unknown id {0:?}")]
    UnknownId(String),

    #[error("id {0:?} is already ongoing")]
    DuplicateId(String),

    #[error("store closed")]
    Closed,

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("bad timestamp {value:?}: {source}")]
    Timestamp {
        value: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("ongoing set poisoned")]
    Poisoned,
}

/// One test run: ongoing until `end_at` is set, terminal afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestRun {
    pub id: String,
    pub test_name: String,
    pub start_at: DateTime<Utc>,
    pub end_at: Option<DateTime<Utc>>,
    pub pass: bool,
    pub fail_cause: String,
}

impl TestRun {
    pub fn is_ongoing(&self) -> bool {
        self.end_at.is_none()
    }
}

/// Lifecycle and queries for test runs.
///
/// Implementations must tolerate concurrent calls from every scheduling
/// loop at once.
pub trait CanaryStore: Send + Sync {
    /// Record `id` as started. It stays in the ongoing set until ended.
    fn start_test(&self, id: &str, name: &str, start_at: DateTime<Utc>) -> Result<TestRun, StoreError>;

    /// Move an ongoing run to its terminal state and persist it. Fails with
    /// [`StoreError::UnknownId`] when `id` is not ongoing.
    fn end_test(&self, id: &str, failure: Option<&str>, end_at: DateTime<Utc>) -> Result<TestRun, StoreError>;

    /// Every persisted terminal run, in no particular order.
    fn list_tests(&self) -> Result<Vec<TestRun>, StoreError>;

    fn list_ongoing_tests(&self) -> Result<Vec<TestRun>, StoreError>;

    /// Look `id` up in the ongoing set.
    fn find_test_by_id(&self, id: &str) -> Result<Option<TestRun>, StoreError>;

    /// Look `id` up among persisted terminal runs.
    fn load_test(&self, id: &str) -> Result<Option<TestRun>, StoreError>;

    fn close(&self) -> Result<(), StoreError>;
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// In-memory database for runs that need not outlive the process. The pool
/// holds a single connection that is never recycled, since every in-memory
/// connection is its own database.
pub fn open_memory_pool() -> Result<Pool, StoreError> {
    let pool = R2D2Pool::builder()
        .max_size(1)
        .max_lifetime(None)
        .idle_timeout(None)
        .build(SqliteConnectionManager::memory())?;
    let conn = pool.get()?;
    schema::migrate(&conn)?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_pool_keeps_its_only_connection() {
        let pool = open_memory_pool().unwrap();
        assert_eq!(pool.max_size(), 1);
        assert_eq!(pool.max_lifetime(), None);
        assert_eq!(pool.idle_timeout(), None);

        let conn = pool.get().unwrap();
        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'tests'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 1);
    }
}
