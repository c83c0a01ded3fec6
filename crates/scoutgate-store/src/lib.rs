//! # Scoutgate Store
//!
//! Embedded `DuckDB` persistence for the two things the pipeline must remember
//! across restarts: dedup reservations and emitted decisions.
//!
//! ## Tables
//!
//! | Table | Key | Description |
//! |-------|-----|-------------|
//! | `dedup_reservations` | `token` | One row per granted reservation window |
//! | `decisions` | `(instrument, cycle_id)` | Strategic decisions, written at most once |
//! | `schema_migrations` | `version` | Applied migration versions |
//!
//! ## Atomicity
//!
//! The reservation write is a single conditional statement:
//!
//! ```text
//! INSERT INTO dedup_reservations (...)
//! SELECT ... WHERE NOT EXISTS (active reservation for instrument)
//! ```
//!
//! so the check and the write cannot interleave with another writer on the
//! same database. Decision writes use `INSERT OR IGNORE` on the primary key,
//! which makes retries idempotent.
//!
//! The API is synchronous; async callers are expected to hop onto a blocking
//! thread.

pub mod migrations;
pub mod pool;

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use ::duckdb::{Connection, ToSql};
use serde::Serialize;
use thiserror::Error;

pub use pool::{ConnectionPool, PooledConnection};

/// Errors raised by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    DuckDb(#[from] ::duckdb::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid record: {0}")]
    InvalidRecord(String),
}

/// Location and pool sizing for the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Root directory for scoutgate state.
    pub scoutgate_home: PathBuf,
    /// Path to the `DuckDB` database file.
    pub db_path: PathBuf,
    /// Idle connections kept for reuse.
    pub max_pool_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::for_home(resolve_scoutgate_home())
    }
}

impl StoreConfig {
    pub fn for_home(scoutgate_home: PathBuf) -> Self {
        let db_path = scoutgate_home.join("state").join("scoutgate.duckdb");
        Self {
            scoutgate_home,
            db_path,
            max_pool_size: 4,
        }
    }
}

/// Persisted dedup reservation. Timestamps are unix epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReservationRecord {
    pub token: String,
    pub instrument: String,
    pub window_start_ms: i64,
    pub window_end_ms: i64,
}

impl ReservationRecord {
    pub fn is_active_at(&self, now_ms: i64) -> bool {
        self.window_end_ms > now_ms
    }
}

/// Result of a conditional reservation insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Inserted,
    Occupied(ReservationRecord),
}

/// Persisted strategic decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionRecord {
    pub instrument: String,
    pub cycle_id: String,
    pub signal: String,
    pub confidence: f64,
    pub sizing_json: String,
    pub created_at_ms: i64,
}

/// Handle to the scoutgate `DuckDB` database.
#[derive(Clone)]
pub struct Store {
    pool: ConnectionPool,
}

impl Store {
    /// Open the store described by `config`, creating directories and applying migrations.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let pool = ConnectionPool::open(config.db_path, config.max_pool_size)?;
        Self::with_pool(pool)
    }

    pub fn open_at(db_path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref().to_path_buf();
        let scoutgate_home = db_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::open(StoreConfig {
            scoutgate_home,
            db_path,
            max_pool_size: 4,
        })
    }

    /// Throwaway in-memory database, mostly for tests and `--ephemeral` runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_pool(ConnectionPool::open_in_memory(2)?)
    }

    fn with_pool(pool: ConnectionPool) -> Result<Self, StoreError> {
        let connection = pool.acquire()?;
        migrations::apply_migrations(&connection)?;
        drop(connection);
        Ok(Self { pool })
    }

    pub fn db_path(&self) -> Option<&Path> {
        self.pool.db_path()
    }

    /// Insert `record` unless the instrument already holds a reservation whose
    /// window ends after `now_ms`. Returns the blocking reservation otherwise.
    pub fn reserve_if_vacant(
        &self,
        record: &ReservationRecord,
        now_ms: i64,
    ) -> Result<ReserveOutcome, StoreError> {
        if record.window_end_ms <= record.window_start_ms {
            return Err(StoreError::InvalidRecord(format!(
                "reservation window for '{}' is empty",
                record.instrument
            )));
        }

        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 6] = [
            &record.token,
            &record.instrument,
            &record.window_start_ms,
            &record.window_end_ms,
            &record.instrument,
            &now_ms,
        ];
        let inserted = connection.execute(
            "INSERT INTO dedup_reservations (token, instrument, window_start_ms, window_end_ms) \
             SELECT ?, ?, ?, ? \
             WHERE NOT EXISTS ( \
                 SELECT 1 FROM dedup_reservations WHERE instrument = ? AND window_end_ms > ? \
             )",
            params.as_slice(),
        )?;

        if inserted == 1 {
            return Ok(ReserveOutcome::Inserted);
        }

        match active_for_instrument(&connection, &record.instrument, now_ms)? {
            Some(existing) => Ok(ReserveOutcome::Occupied(existing)),
            // The blocking row expired between the two statements; the caller may retry.
            None => Err(StoreError::InvalidRecord(format!(
                "reservation for '{}' was neither inserted nor blocked",
                record.instrument
            ))),
        }
    }

    /// Reservations whose window is still open at `now_ms`, oldest first.
    pub fn active_reservations(&self, now_ms: i64) -> Result<Vec<ReservationRecord>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT token, instrument, window_start_ms, window_end_ms \
             FROM dedup_reservations WHERE window_end_ms > ? \
             ORDER BY window_start_ms, instrument",
        )?;
        let rows = statement.query_map([now_ms], map_reservation)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn release_reservation(&self, token: &str) -> Result<bool, StoreError> {
        let connection = self.pool.acquire()?;
        let removed = connection.execute(
            "DELETE FROM dedup_reservations WHERE token = ?",
            [token],
        )?;
        Ok(removed > 0)
    }

    /// Admin clear: drop every reservation, or only those of one instrument.
    pub fn clear_reservations(&self, instrument: Option<&str>) -> Result<usize, StoreError> {
        let connection = self.pool.acquire()?;
        let removed = match instrument {
            Some(instrument) => connection.execute(
                "DELETE FROM dedup_reservations WHERE instrument = ?",
                [instrument],
            )?,
            None => connection.execute("DELETE FROM dedup_reservations", [])?,
        };
        Ok(removed)
    }

    /// Rows in the reservation table, expired ones included.
    pub fn reservation_count(&self) -> Result<u64, StoreError> {
        let connection = self.pool.acquire()?;
        let count: i64 = connection.query_row(
            "SELECT COUNT(*) FROM dedup_reservations",
            [],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    pub fn purge_expired(&self, now_ms: i64) -> Result<usize, StoreError> {
        let connection = self.pool.acquire()?;
        let removed = connection.execute(
            "DELETE FROM dedup_reservations WHERE window_end_ms <= ?",
            [now_ms],
        )?;
        Ok(removed)
    }

    /// Persist a decision once per `(instrument, cycle_id)`.
    ///
    /// Returns `true` when a row was written and `false` when the same key was
    /// already present.
    pub fn record_decision(&self, record: &DecisionRecord) -> Result<bool, StoreError> {
        if !record.confidence.is_finite() {
            return Err(StoreError::InvalidRecord(format!(
                "decision for '{}' has non-finite confidence",
                record.instrument
            )));
        }

        let connection = self.pool.acquire()?;
        let params: [&dyn ToSql; 6] = [
            &record.instrument,
            &record.cycle_id,
            &record.signal,
            &record.confidence,
            &record.sizing_json,
            &record.created_at_ms,
        ];
        let inserted = connection.execute(
            "INSERT OR IGNORE INTO decisions \
             (instrument, cycle_id, signal, confidence, sizing_json, created_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?)",
            params.as_slice(),
        )?;
        Ok(inserted == 1)
    }

    pub fn decisions_for(&self, instrument: &str) -> Result<Vec<DecisionRecord>, StoreError> {
        let connection = self.pool.acquire()?;
        let mut statement = connection.prepare(
            "SELECT instrument, cycle_id, signal, confidence, sizing_json, created_at_ms \
             FROM decisions WHERE instrument = ? ORDER BY created_at_ms, cycle_id",
        )?;
        let rows = statement.query_map([instrument], |row| {
            Ok(DecisionRecord {
                instrument: row.get(0)?,
                cycle_id: row.get(1)?,
                signal: row.get(2)?,
                confidence: row.get(3)?,
                sizing_json: row.get(4)?,
                created_at_ms: row.get(5)?,
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    pub fn decision_count(&self) -> Result<u64, StoreError> {
        let connection = self.pool.acquire()?;
        let count: i64 = connection.query_row("SELECT COUNT(*) FROM decisions", [], |row| {
            row.get(0)
        })?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

fn active_for_instrument(
    connection: &Connection,
    instrument: &str,
    now_ms: i64,
) -> Result<Option<ReservationRecord>, StoreError> {
    let mut statement = connection.prepare(
        "SELECT token, instrument, window_start_ms, window_end_ms \
         FROM dedup_reservations WHERE instrument = ? AND window_end_ms > ? \
         ORDER BY window_start_ms LIMIT 1",
    )?;
    let params: [&dyn ToSql; 2] = [&instrument, &now_ms];
    let mut rows = statement.query_map(params.as_slice(), map_reservation)?;
    rows.next().transpose().map_err(StoreError::from)
}

fn map_reservation(row: &::duckdb::Row<'_>) -> Result<ReservationRecord, ::duckdb::Error> {
    Ok(ReservationRecord {
        token: row.get(0)?,
        instrument: row.get(1)?,
        window_start_ms: row.get(2)?,
        window_end_ms: row.get(3)?,
    })
}

/// Resolve the scoutgate data directory.
///
/// `SCOUTGATE_HOME` wins, then `$HOME/.scoutgate`, then `./.scoutgate`.
pub fn resolve_scoutgate_home() -> PathBuf {
    if let Some(home) = env::var_os("SCOUTGATE_HOME").filter(|value| !value.is_empty()) {
        return PathBuf::from(home);
    }
    if let Some(home) = env::var_os("HOME").filter(|value| !value.is_empty()) {
        return PathBuf::from(home).join(".scoutgate");
    }
    PathBuf::from(".scoutgate")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn reservation(token: &str, instrument: &str, start: i64, end: i64) -> ReservationRecord {
        ReservationRecord {
            token: token.to_owned(),
            instrument: instrument.to_owned(),
            window_start_ms: start,
            window_end_ms: end,
        }
    }

    fn decision(instrument: &str, cycle_id: &str) -> DecisionRecord {
        DecisionRecord {
            instrument: instrument.to_owned(),
            cycle_id: cycle_id.to_owned(),
            signal: String::from("long"),
            confidence: 0.82,
            sizing_json: String::from(r#"{"entry":100.0}"#),
            created_at_ms: 1_000,
        }
    }

    #[test]
    fn applies_migrations_once() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("state").join("scoutgate.duckdb");

        let store = Store::open_at(&db_path).expect("first open");
        drop(store);
        let store = Store::open_at(&db_path).expect("second open");

        let connection = store.pool.acquire().expect("connection");
        let versions = migrations::applied_versions(&connection).expect("versions");
        assert_eq!(versions, vec!["0001_dedup_reservations", "0002_decisions"]);
    }

    #[test]
    fn conditional_insert_blocks_overlapping_windows() {
        let store = Store::open_in_memory().expect("store");

        let first = store
            .reserve_if_vacant(&reservation("t-1", "BTCUSDT", 0, 1_000), 0)
            .expect("first reserve");
        assert_eq!(first, ReserveOutcome::Inserted);

        let second = store
            .reserve_if_vacant(&reservation("t-2", "BTCUSDT", 500, 1_500), 500)
            .expect("second reserve");
        match second {
            ReserveOutcome::Occupied(existing) => assert_eq!(existing.token, "t-1"),
            other => panic!("expected occupied, got {other:?}"),
        }

        let other_instrument = store
            .reserve_if_vacant(&reservation("t-3", "ETHUSDT", 500, 1_500), 500)
            .expect("other instrument");
        assert_eq!(other_instrument, ReserveOutcome::Inserted);
    }

    #[test]
    fn expired_windows_do_not_block() {
        let store = Store::open_in_memory().expect("store");
        store
            .reserve_if_vacant(&reservation("t-1", "SOLUSDT", 0, 1_000), 0)
            .expect("first reserve");

        let outcome = store
            .reserve_if_vacant(&reservation("t-2", "SOLUSDT", 1_000, 2_000), 1_000)
            .expect("after window");
        assert_eq!(outcome, ReserveOutcome::Inserted);

        assert_eq!(store.reservation_count().expect("count"), 2);
        assert_eq!(store.purge_expired(1_000).expect("purge"), 1);
        assert_eq!(store.reservation_count().expect("count"), 1);
        let active = store.active_reservations(1_000).expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].token, "t-2");
    }

    #[test]
    fn rejects_empty_window() {
        let store = Store::open_in_memory().expect("store");
        let error = store
            .reserve_if_vacant(&reservation("t-1", "BTCUSDT", 10, 10), 0)
            .expect_err("empty window must fail");
        assert!(matches!(error, StoreError::InvalidRecord(_)));
    }

    #[test]
    fn release_and_clear_remove_rows() {
        let store = Store::open_in_memory().expect("store");
        for (token, instrument) in [("a", "BTCUSDT"), ("b", "ETHUSDT"), ("c", "SOLUSDT")] {
            store
                .reserve_if_vacant(&reservation(token, instrument, 0, 10_000), 0)
                .expect("reserve");
        }

        assert!(store.release_reservation("a").expect("release"));
        assert!(!store.release_reservation("a").expect("second release"));
        assert_eq!(store.clear_reservations(Some("ETHUSDT")).expect("clear one"), 1);
        assert_eq!(store.clear_reservations(None).expect("clear all"), 1);
        assert!(store.active_reservations(0).expect("active").is_empty());
    }

    #[test]
    fn record_decision_is_idempotent_per_cycle() {
        let store = Store::open_in_memory().expect("store");

        assert!(store.record_decision(&decision("BTCUSDT", "c-1")).expect("insert"));
        assert!(!store.record_decision(&decision("BTCUSDT", "c-1")).expect("retry"));
        assert!(store.record_decision(&decision("BTCUSDT", "c-2")).expect("next cycle"));

        assert_eq!(store.decision_count().expect("count"), 2);
        assert_eq!(store.decisions_for("BTCUSDT").expect("list").len(), 2);
    }

    #[test]
    fn parameters_are_never_interpolated() {
        let store = Store::open_in_memory().expect("store");
        let hostile = "BTC'; DROP TABLE decisions; --";

        assert!(store.record_decision(&decision(hostile, "c-1")).expect("insert"));
        assert_eq!(store.decisions_for(hostile).expect("list").len(), 1);
    }

    #[test]
    fn reservations_survive_reopen() {
        let temp = tempdir().expect("tempdir");
        let db_path = temp.path().join("scoutgate.duckdb");

        {
            let store = Store::open_at(&db_path).expect("open");
            store
                .reserve_if_vacant(&reservation("t-1", "BTCUSDT", 0, 5_000), 0)
                .expect("reserve");
        }

        let reopened = Store::open_at(&db_path).expect("reopen");
        let active = reopened.active_reservations(1_000).expect("active");
        assert_eq!(active, vec![reservation("t-1", "BTCUSDT", 0, 5_000)]);
    }
}
