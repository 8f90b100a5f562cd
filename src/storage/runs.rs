//! SQLite-backed [`CanaryStore`].

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use super::{CanaryStore, Pool, StoreError, TestRun};

const SELECT_RUN: &str = "SELECT id, name, start_at, end_at, pass, fail_cause FROM tests";

pub struct SqliteStore {
    pool: Mutex<Option<Pool>>,
    ongoing: Mutex<HashMap<String, TestRun>>,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool: Mutex::new(Some(pool)),
            ongoing: Mutex::new(HashMap::new()),
        }
    }

    fn pool(&self) -> Result<Pool, StoreError> {
        self.pool
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .clone()
            .ok_or(StoreError::Closed)
    }

    /// The ongoing set, or [`StoreError::Closed`] once the store is closed.
    fn ongoing(&self) -> Result<MutexGuard<'_, HashMap<String, TestRun>>, StoreError> {
        self.pool()?;
        self.ongoing.lock().map_err(|_| StoreError::Poisoned)
    }

    fn persist(&self, run: &TestRun) -> Result<(), StoreError> {
        let end_at = run.end_at.unwrap_or(run.start_at);
        let mut conn = self.pool()?.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO tests (id, name, start_at, end_at, pass, fail_cause)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                run.id,
                run.test_name,
                format_timestamp(run.start_at),
                format_timestamp(end_at),
                run.pass,
                run.fail_cause,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }
}

impl CanaryStore for SqliteStore {
    fn start_test(&self, id: &str, name: &str, start_at: DateTime<Utc>) -> Result<TestRun, StoreError> {
        let mut ongoing = self.ongoing()?;
        if ongoing.contains_key(id) {
            return Err(StoreError::DuplicateId(id.to_string()));
        }
        let run = TestRun {
            id: id.to_string(),
            test_name: name.to_string(),
            start_at,
            end_at: None,
            pass: false,
            fail_cause: String::new(),
        };
        ongoing.insert(run.id.clone(), run.clone());
        debug!(test.id = %id, test.name = %name, "run started");
        Ok(run)
    }

    fn end_test(&self, id: &str, failure: Option<&str>, end_at: DateTime<Utc>) -> Result<TestRun, StoreError> {
        let mut run = self
            .ongoing()?
            .remove(id)
            .ok_or_else(|| StoreError::UnknownId(id.to_string()))?;

        run.end_at = Some(end_at);
        run.pass = failure.is_none();
        run.fail_cause = failure.unwrap_or_default().to_string();

        self.persist(&run)?;
        debug!(test.id = %id, pass = run.pass, "run ended");
        Ok(run)
    }

    fn list_tests(&self) -> Result<Vec<TestRun>, StoreError> {
        let conn = self.pool()?.get()?;
        let mut stmt = conn.prepare(SELECT_RUN)?;
        let rows = stmt.query_map([], read_row)?;
        rows.map(|row| row?.into_run()).collect()
    }

    fn list_ongoing_tests(&self) -> Result<Vec<TestRun>, StoreError> {
        let mut runs: Vec<TestRun> = self.ongoing()?.values().cloned().collect();
        runs.sort_by(|a, b| a.start_at.cmp(&b.start_at).then_with(|| a.id.cmp(&b.id)));
        Ok(runs)
    }

    fn find_test_by_id(&self, id: &str) -> Result<Option<TestRun>, StoreError> {
        Ok(self.ongoing()?.get(id).cloned())
    }

    fn load_test(&self, id: &str) -> Result<Option<TestRun>, StoreError> {
        let conn = self.pool()?.get()?;
        let row = conn
            .query_row(&format!("{SELECT_RUN} WHERE id = ?1"), [id], read_row)
            .optional()?;
        row.map(StoredRun::into_run).transpose()
    }

    fn close(&self) -> Result<(), StoreError> {
        let pool = self
            .pool
            .lock()
            .map_err(|_| StoreError::Poisoned)?
            .take()
            .ok_or(StoreError::Closed)?;
        // Fold the WAL back into the main file before the pool goes away.
        match pool.get() {
            Ok(conn) => {
                if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                    warn!(error = %e, "WAL checkpoint on close failed");
                }
            }
            Err(e) => warn!(error = %e, "no connection for the WAL checkpoint on close"),
        }
        debug!("outcome store closed");
        Ok(())
    }
}

/// A `tests` row before its timestamps are parsed.
struct StoredRun {
    id: String,
    name: String,
    start_at: String,
    end_at: String,
    pass: bool,
    fail_cause: String,
}

impl StoredRun {
    fn into_run(self) -> Result<TestRun, StoreError> {
        Ok(TestRun {
            start_at: parse_timestamp(&self.start_at)?,
            end_at: Some(parse_timestamp(&self.end_at)?),
            id: self.id,
            test_name: self.name,
            pass: self.pass,
            fail_cause: self.fail_cause,
        })
    }
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRun> {
    Ok(StoredRun {
        id: row.get(0)?,
        name: row.get(1)?,
        start_at: row.get(2)?,
        end_at: row.get(3)?,
        pass: row.get(4)?,
        fail_cause: row.get(5)?,
    })
}

/// RFC3339, UTC, whole seconds.
fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|source| StoreError::Timestamp {
            value: value.to_string(),
            source,
        })
}
