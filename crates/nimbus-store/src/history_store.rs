//! SQLite-backed history of weather observations.
//!
//! `HistoryStore` keeps one row per observation. All access goes through a
//! single connection behind a `parking_lot::Mutex`, so every operation
//! (including a whole `fetch_all` scan) sees either the state before or the
//! state after a concurrent `delete_all`, never a mix.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use nimbus_core::{RusqliteErrorExt, StoreError};
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{params, Connection, ErrorCode};
use uuid::Uuid;

use crate::observation::{ObservationRecord, WeatherObservation};

/// Number of observations returned when callers don't pick a limit.
pub const DEFAULT_FETCH_LIMIT: usize = 50;

/// Default upper bound on waiting for the connection lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(50);

/// Persistent, queryable log of weather observations.
pub struct HistoryStore {
    conn: Mutex<Connection>,
    lock_timeout: Duration,
    corrupt_skipped: AtomicU64,
}

impl HistoryStore {
    /// Open or create the history database at `path`.
    ///
    /// Creates the parent directory and schema if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Open(format!("{}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Open(e.to_string()))?;
        let store = Self::from_connection(conn)?;
        tracing::debug!("Opened history store at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory history store (previews and tests).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(|e| StoreError::Open(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        conn.busy_timeout(DEFAULT_LOCK_TIMEOUT)
            .map_err(|e| e.into_store_error())?;
        Ok(Self {
            conn: Mutex::new(conn),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            corrupt_skipped: AtomicU64::new(0),
        })
    }

    /// Override how long an operation waits for the store lock before
    /// failing with [`StoreError::Timeout`].
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        if let Err(e) = self.conn.get_mut().busy_timeout(timeout) {
            tracing::warn!("Failed to set history busy timeout: {}", e);
        }
        self
    }

    /// Initialize the database schema.
    ///
    /// Every attribute column is nullable: rows written by older or foreign
    /// writers may be incomplete, and the read path filters them out.
    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS observations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT UNIQUE,
                city TEXT,
                temperature REAL,
                feels_like REAL,
                description TEXT,
                icon TEXT,
                humidity INTEGER,
                timestamp_us INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_observations_newest ON observations(timestamp_us DESC, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_observations_city ON observations(city);
            "#,
        )
        .map_err(|e| StoreError::Open(format!("Failed to initialize schema: {}", e)))
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.try_lock_for(self.lock_timeout).ok_or_else(|| {
            tracing::warn!("History store lock timed out during {}", operation);
            StoreError::timeout(operation, self.lock_timeout)
        })
    }

    /// Append an observation.
    ///
    /// # Errors
    /// `StoreError::DuplicateId` if an observation with the same id is stored,
    /// `StoreError::Persistence` for any other write failure.
    pub fn insert(&self, observation: &WeatherObservation) -> Result<(), StoreError> {
        let record = ObservationRecord::from(observation);
        let conn = self.lock("insert")?;

        conn.execute(
            "INSERT INTO observations (id, city, temperature, feels_like, description, icon, humidity, timestamp_us)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.id,
                record.city,
                record.temperature,
                record.feels_like,
                record.description,
                record.icon,
                record.humidity,
                record.timestamp_us,
            ],
        )
        .map_err(|e| {
            if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
                StoreError::DuplicateId(observation.id.to_string())
            } else {
                e.into_store_error()
            }
        })?;

        tracing::debug!("Stored observation {} for {}", observation.id, observation.city);
        Ok(())
    }

    /// Newest observations first, at most `limit` of them.
    ///
    /// Ordered by timestamp descending, ties broken by most recent insert.
    /// Incomplete rows are skipped and do not count against `limit`.
    pub fn fetch_all(&self, limit: usize) -> Result<Vec<WeatherObservation>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let conn = self.lock("fetch_all")?;
        let sql = format!(
            "SELECT {} FROM observations ORDER BY timestamp_us DESC, seq DESC",
            ObservationRecord::COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| e.into_store_error())?;
        let mut rows = stmt.query([]).map_err(|e| e.into_store_error())?;

        let mut observations = Vec::with_capacity(limit.min(DEFAULT_FETCH_LIMIT));
        while observations.len() < limit {
            let Some(row) = rows.next().map_err(|e| e.into_store_error())? else {
                break;
            };
            if let Some(obs) = self.complete(ObservationRecord::from_row(row)) {
                observations.push(obs);
            }
        }

        Ok(observations)
    }

    /// [`fetch_all`](Self::fetch_all) with [`DEFAULT_FETCH_LIMIT`].
    pub fn fetch_recent(&self) -> Result<Vec<WeatherObservation>, StoreError> {
        self.fetch_all(DEFAULT_FETCH_LIMIT)
    }

    /// All observations whose city matches `city` exactly (case-sensitive), newest first.
    pub fn fetch_by_city(&self, city: &str) -> Result<Vec<WeatherObservation>, StoreError> {
        let conn = self.lock("fetch_by_city")?;
        let sql = format!(
            "SELECT {} FROM observations WHERE city = ?1 ORDER BY timestamp_us DESC, seq DESC",
            ObservationRecord::COLUMNS
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| e.into_store_error())?;
        let mut rows = stmt.query(params![city]).map_err(|e| e.into_store_error())?;

        let mut observations = Vec::new();
        while let Some(row) = rows.next().map_err(|e| e.into_store_error())? {
            if let Some(obs) = self.complete(ObservationRecord::from_row(row)) {
                observations.push(obs);
            }
        }

        Ok(observations)
    }

    /// Remove the observation with `id`. Returns whether one was removed.
    pub fn delete_one(&self, id: Uuid) -> Result<bool, StoreError> {
        let conn = self.lock("delete_one")?;
        let removed = conn
            .execute("DELETE FROM observations WHERE id = ?1", params![id.to_string()])
            .map_err(|e| e.into_store_error())?;

        if removed > 0 {
            tracing::debug!("Deleted observation {}", id);
        }
        Ok(removed > 0)
    }

    /// Remove every observation in one transaction. Returns how many were removed.
    ///
    /// On failure the transaction rolls back and all records remain.
    pub fn delete_all(&self) -> Result<usize, StoreError> {
        let mut conn = self.lock("delete_all")?;
        let tx = conn.transaction().map_err(|e| e.into_store_error())?;
        let removed = tx
            .execute("DELETE FROM observations", [])
            .map_err(|e| e.into_store_error())?;
        tx.commit().map_err(|e| e.into_store_error())?;

        tracing::info!("Cleared history ({} observations)", removed);
        Ok(removed)
    }

    /// Number of stored rows, including incomplete ones.
    pub fn count(&self) -> Result<usize, StoreError> {
        let conn = self.lock("count")?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))
            .map_err(|e| e.into_store_error())?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Incomplete rows dropped by reads since this store was opened.
    pub fn corrupt_records_skipped(&self) -> u64 {
        self.corrupt_skipped.load(Ordering::Relaxed)
    }

    fn complete(&self, record: ObservationRecord) -> Option<WeatherObservation> {
        match WeatherObservation::try_from(record) {
            Ok(obs) => Some(obs),
            Err(e) => {
                self.corrupt_skipped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Skipping {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use tempfile::tempdir;

    fn create_test_store() -> HistoryStore {
        HistoryStore::in_memory().expect("Failed to create in-memory store")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn observation(city: &str, secs: i64) -> WeatherObservation {
        WeatherObservation::new(city, 10.0, 9.0, "Cloudy", "04d", 70).with_timestamp(at(secs))
    }

    #[test]
    fn test_insert_and_fetch() {
        let store = create_test_store();
        let obs = observation("London", 0);

        store.insert(&obs).unwrap();

        let all = store.fetch_all(10).unwrap();
        assert_eq!(all, vec![obs]);
    }

    #[test]
    fn test_fetch_all_newest_first() {
        let store = create_test_store();
        let t1 = observation("A", 1);
        let t2 = observation("B", 2);
        let t3 = observation("C", 3);

        // Insert out of order; ordering comes from timestamps
        store.insert(&t2).unwrap();
        store.insert(&t3).unwrap();
        store.insert(&t1).unwrap();

        let ids: Vec<_> = store.fetch_all(3).unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![t3.id, t2.id, t1.id]);
    }

    #[test]
    fn test_equal_timestamps_latest_insert_first() {
        let store = create_test_store();
        let first = observation("Oslo", 5);
        let second = observation("Oslo", 5);

        store.insert(&first).unwrap();
        store.insert(&second).unwrap();

        let ids: Vec<_> = store.fetch_all(2).unwrap().into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[test]
    fn test_fetch_all_bounded_to_most_recent() {
        let store = create_test_store();
        for i in 0..100 {
            store.insert(&observation("City", i)).unwrap();
        }

        let recent = store.fetch_all(50).unwrap();
        assert_eq!(recent.len(), 50);
        assert_eq!(recent[0].timestamp, at(99));
        assert_eq!(recent[49].timestamp, at(50));
        assert_eq!(store.fetch_recent().unwrap().len(), DEFAULT_FETCH_LIMIT);
    }

    #[test]
    fn test_fetch_all_zero_limit() {
        let store = create_test_store();
        store.insert(&observation("City", 0)).unwrap();
        assert!(store.fetch_all(0).unwrap().is_empty());
    }

    #[test]
    fn test_fetch_by_city_exact_match() {
        let store = create_test_store();
        store.insert(&observation("Paris", 1)).unwrap();
        store.insert(&observation("Tokyo", 2)).unwrap();
        store.insert(&observation("Paris", 3)).unwrap();
        store.insert(&observation("paris", 4)).unwrap();
        store.insert(&observation("Tokyo", 5)).unwrap();

        let paris = store.fetch_by_city("Paris").unwrap();
        assert_eq!(paris.len(), 2);
        assert!(paris.iter().all(|o| o.city == "Paris"));
        assert_eq!(paris[0].timestamp, at(3));
        assert_eq!(paris[1].timestamp, at(1));
    }

    #[test]
    fn test_delete_one() {
        let store = create_test_store();
        let keep = observation("Rome", 1);
        let doomed = observation("Rome", 2);
        store.insert(&keep).unwrap();
        store.insert(&doomed).unwrap();

        assert!(store.delete_one(doomed.id).unwrap());
        assert_eq!(store.fetch_all(10).unwrap(), vec![keep]);
    }

    #[test]
    fn test_delete_one_missing_is_noop() {
        let store = create_test_store();
        store.insert(&observation("Rome", 1)).unwrap();

        assert!(!store.delete_one(Uuid::new_v4()).unwrap());
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_delete_all() {
        let store = create_test_store();
        for obs in WeatherObservation::samples() {
            store.insert(&obs).unwrap();
        }

        assert_eq!(store.delete_all().unwrap(), 4);
        assert_eq!(store.count().unwrap(), 0);
        assert!(store.fetch_all(10).unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let store = create_test_store();
        let obs = observation("Lima", 1);
        store.insert(&obs).unwrap();

        let err = store.insert(&obs).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateId(_)));
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_corrupt_record_skipped_without_failing() {
        let store = create_test_store();
        let older = observation("Paris", 1);
        let newer = observation("Paris", 3);
        store.insert(&older).unwrap();
        store.insert(&newer).unwrap();

        // A row with no description, newer than everything else
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO observations (id, city, temperature, feels_like, description, icon, humidity, timestamp_us)
                 VALUES (?1, 'Paris', 1.0, 1.0, NULL, '01d', 50, ?2)",
                params![Uuid::new_v4().to_string(), at(10).timestamp_micros()],
            )
            .unwrap();
        }

        let all = store.fetch_all(2).unwrap();
        assert_eq!(all.iter().map(|o| o.id).collect::<Vec<_>>(), vec![newer.id, older.id]);
        assert_eq!(store.fetch_by_city("Paris").unwrap().len(), 2);
        assert_eq!(store.corrupt_records_skipped(), 2);
        assert_eq!(store.count().unwrap(), 3);
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("history.sqlite3");
        let obs = observation("Berlin", 1);

        {
            let store = HistoryStore::open(&path).unwrap();
            store.insert(&obs).unwrap();
        }

        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.fetch_all(10).unwrap(), vec![obs]);
    }

    #[test]
    fn test_lock_timeout_surfaces_distinct_error() {
        let store = create_test_store().with_lock_timeout(Duration::from_millis(10));
        let _held = store.conn.lock();

        let err = store.fetch_all(10).unwrap_err();
        assert!(err.is_timeout());
    }
}
