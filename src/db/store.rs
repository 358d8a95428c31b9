//! SQLite database store implementation.

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OpenFlags, Result as SqlResult, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

use super::aggregate::Tally;
use super::migrations::{apply_migrations, BASELINE_SCHEMA};
use super::models::*;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Cannot create database {}: already exists", .0.display())]
    AlreadyInitialized(PathBuf),
    #[error("Migration error: {0}")]
    Migration(String),
}

/// Create the database file with the baseline schema.
///
/// An existing file is an error unless `soft` is set, in which case this is a
/// no-op. Pending migrations are applied by [`Store::open`].
pub fn initialize<P: AsRef<Path>>(path: P, soft: bool) -> Result<(), DbError> {
    let path = path.as_ref();
    if path.exists() {
        if soft {
            return Ok(());
        }
        return Err(DbError::AlreadyInitialized(path.to_path_buf()));
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(BASELINE_SCHEMA)?;
    tracing::info!("Created database at {}", path.display());
    Ok(())
}

#[derive(Default)]
struct Pools {
    read_write: Vec<Connection>,
    read_only: Vec<Connection>,
}

impl Pools {
    fn get_mut(&mut self, readonly: bool) -> &mut Vec<Connection> {
        if readonly {
            &mut self.read_only
        } else {
            &mut self.read_write
        }
    }
}

/// Database store handing out pooled connections.
///
/// Read-write and read-only connections are pooled separately. The lock only
/// guards pool membership; a checked-out connection belongs to its caller.
pub struct Store {
    path: PathBuf,
    pools: Mutex<Pools>,
}

impl Store {
    /// Open an initialized store and bring its schema up to date.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let path = path.as_ref().to_path_buf();
        let mut conn = open_connection(&path, false)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        let version = apply_migrations(&mut conn)?;
        tracing::info!("Database schema at version {}", version);

        let store = Self {
            path,
            pools: Mutex::new(Pools::default()),
        };
        store.checkin(false, conn);
        Ok(store)
    }

    /// Run `f` inside a transaction on a pooled connection.
    ///
    /// On success the transaction commits and the connection goes back to
    /// its pool. On error the transaction is rolled back and the connection
    /// is closed instead of being reused.
    pub fn with_connection<F, R>(&self, readonly: bool, f: F) -> Result<R, DbError>
    where
        F: FnOnce(&Connection) -> Result<R, DbError>,
    {
        let conn = match self.checkout(readonly) {
            Some(conn) => conn,
            None => open_connection(&self.path, readonly)?,
        };

        if !conn.is_autocommit() {
            tracing::warn!("Rolling back a transaction left open on a pooled connection");
            conn.execute_batch("ROLLBACK")?;
        }

        let tx = conn.unchecked_transaction()?;
        match f(&tx) {
            Ok(value) => {
                tx.commit()?;
                self.checkin(readonly, conn);
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback() {
                    tracing::warn!("Rollback failed: {}", rollback);
                }
                tracing::debug!("Discarding connection after error: {}", e);
                Err(e)
            }
        }
    }

    /// Number of idle connections in a pool.
    pub fn idle_connections(&self, readonly: bool) -> usize {
        self.lock_pools().get_mut(readonly).len()
    }

    fn checkout(&self, readonly: bool) -> Option<Connection> {
        self.lock_pools().get_mut(readonly).pop()
    }

    fn checkin(&self, readonly: bool, conn: Connection) {
        self.lock_pools().get_mut(readonly).push(conn);
    }

    fn lock_pools(&self) -> MutexGuard<'_, Pools> {
        self.pools
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn open_connection(path: &Path, readonly: bool) -> Result<Connection, DbError> {
    let flags = if readonly {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };
    let conn = Connection::open_with_flags(path, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

// --- Writes ---

/// Insert one check result. Fails on a duplicate (check, timestamp).
pub fn save_check(conn: &Connection, res: &CheckResult) -> Result<(), DbError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO checks (check_name, timestamp, duration, size, status, passed, errors)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )?;
    stmt.execute(params![
        res.check,
        to_epoch(res.timestamp),
        res.duration,
        res.size,
        res.status,
        res.passed,
        res.errors.join("\n"),
    ])?;
    Ok(())
}

/// Insert one snapshot. Fails on a duplicate id.
pub fn save_snapshot(conn: &Connection, snap: &Snapshot) -> Result<(), DbError> {
    let headers = serde_json::to_string(&snap.headers)?;
    let mut stmt = conn.prepare_cached(
        "INSERT INTO snapshots
             (uuid, check_name, timestamp, duration, size, status, headers, content)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    stmt.execute(params![
        snap.id,
        snap.check,
        to_epoch(snap.timestamp),
        snap.duration,
        snap.size,
        snap.status,
        headers,
        snap.content,
    ])?;
    Ok(())
}

// --- Reads ---

/// Check results with `start <= timestamp < end`, ordered by check and time.
pub fn results_between(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<CheckResult>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT check_name, timestamp, duration, size, status, passed, errors FROM checks
         WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY check_name, timestamp",
    )?;
    let results = stmt
        .query_map(params![to_epoch(start), to_epoch(end)], check_from_row)?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(results)
}

/// Look up a full snapshot by id.
pub fn get_snapshot(conn: &Connection, id: &str) -> Result<Option<Snapshot>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT uuid, check_name, timestamp, duration, size, status, headers, content
         FROM snapshots WHERE uuid = ?1",
    )?;
    let mut rows = stmt.query(params![id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let headers: String = row.get(6)?;
    Ok(Some(Snapshot {
        id: row.get(0)?,
        check: row.get(1)?,
        timestamp: timestamp_column(row, 2)?,
        duration: row.get(3)?,
        size: row.get(4)?,
        status: row.get(5)?,
        headers: serde_json::from_str(&headers)?,
        content: row.get(7)?,
    }))
}

/// Snapshot ids and times with `start <= timestamp < end`.
pub fn snapshots_between(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<SnapshotRef>, DbError> {
    let mut stmt = conn.prepare_cached(
        "SELECT uuid, check_name, timestamp FROM snapshots
         WHERE timestamp >= ?1 AND timestamp < ?2 ORDER BY check_name, timestamp",
    )?;
    let snaps = stmt
        .query_map(params![to_epoch(start), to_epoch(end)], |row| {
            Ok(SnapshotRef {
                id: row.get(0)?,
                check: row.get(1)?,
                timestamp: timestamp_column(row, 2)?,
            })
        })?
        .collect::<SqlResult<Vec<_>>>()?;
    Ok(snaps)
}

/// Uptime and latency over the whole history of every check.
///
/// One scan of `checks`, folded with the same [`Tally`] the bucketed
/// aggregation uses, so window and all-time figures share the duration floor
/// and the geometric mean. `LN`/`EXP` are only present in SQLite builds with
/// `SQLITE_ENABLE_MATH_FUNCTIONS`, which a system library may lack.
pub fn all_time_stats(conn: &Connection) -> Result<BTreeMap<String, TotalStats>, DbError> {
    let mut stmt = conn.prepare_cached("SELECT check_name, passed, duration FROM checks")?;
    let mut rows = stmt.query([])?;

    let mut tallies: HashMap<String, Tally> = HashMap::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        tallies
            .entry(name)
            .or_default()
            .add(row.get(1)?, row.get(2)?);
    }

    Ok(tallies
        .into_iter()
        .map(|(name, tally)| (name, tally.totals()))
        .collect())
}

fn check_from_row(row: &Row<'_>) -> SqlResult<CheckResult> {
    let errors: String = row.get(6)?;
    Ok(CheckResult {
        check: row.get(0)?,
        timestamp: timestamp_column(row, 1)?,
        duration: row.get(2)?,
        size: row.get(3)?,
        status: row.get(4)?,
        passed: row.get(5)?,
        errors: if errors.is_empty() {
            Vec::new()
        } else {
            errors.split('\n').map(str::to_string).collect()
        },
    })
}

/// Epoch seconds as stored in the timestamp columns.
pub fn to_epoch(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Inverse of [`to_epoch`]. `None` for values no `DateTime` can hold.
pub fn from_epoch(secs: f64) -> Option<DateTime<Utc>> {
    if !secs.is_finite() {
        return None;
    }
    DateTime::from_timestamp_micros((secs * 1_000_000.0).round() as i64)
}

/// Read an epoch timestamp column, failing the row if it is out of range.
fn timestamp_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let secs: f64 = row.get(idx)?;
    from_epoch(secs).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Real,
            format!("timestamp {secs} out of range").into(),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::panic::AssertUnwindSafe;
    use tempfile::TempDir;

    fn open_store() -> (TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upcheck.db");
        initialize(&path, false).unwrap();
        let store = Store::open(&path).unwrap();
        (dir, store)
    }

    fn result(check: &str, ts: DateTime<Utc>, passed: bool) -> CheckResult {
        CheckResult {
            check: check.to_string(),
            timestamp: ts,
            duration: 0.125,
            size: 512,
            status: if passed { 200 } else { 503 },
            passed,
            errors: if passed {
                vec![]
            } else {
                vec!["Status check failed".to_string(), "Body check failed".to_string()]
            },
        }
    }

    #[test]
    fn test_initialize_hard_and_soft() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upcheck.db");

        initialize(&path, false).unwrap();
        assert!(matches!(
            initialize(&path, false),
            Err(DbError::AlreadyInitialized(_))
        ));
        initialize(&path, true).unwrap();
    }

    #[test]
    fn test_open_requires_initialized_store() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Store::open(dir.path().join("missing.db")).is_err());
    }

    #[test]
    fn test_check_round_trip() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
            + chrono::Duration::milliseconds(375);
        let failing = result("web", ts, false);

        store
            .with_connection(false, |conn| save_check(conn, &failing))
            .unwrap();

        let fetched = store
            .with_connection(true, |conn| {
                results_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert_eq!(fetched, vec![failing]);
    }

    #[test]
    fn test_duplicate_key_conflicts() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        store
            .with_connection(false, |conn| save_check(conn, &result("web", ts, true)))
            .unwrap();
        let dup = store.with_connection(false, |conn| save_check(conn, &result("web", ts, false)));
        assert!(matches!(dup, Err(DbError::Sqlite(_))));

        // Same timestamp on another check is fine.
        store
            .with_connection(false, |conn| save_check(conn, &result("api", ts, true)))
            .unwrap();

        let rows = store
            .with_connection(true, |conn| {
                results_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.passed));
    }

    #[test]
    fn test_range_is_half_open() {
        let (_dir, store) = open_store();
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let end = start + chrono::Duration::hours(1);

        store
            .with_connection(false, |conn| {
                save_check(conn, &result("web", start, true))?;
                save_check(conn, &result("web", end, true))
            })
            .unwrap();

        let rows = store
            .with_connection(true, |conn| results_between(conn, start, end))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, start);
    }

    #[test]
    fn test_snapshot_round_trip() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let snap = Snapshot {
            id: "5b0c1f9e-0000-4000-8000-000000000001".to_string(),
            check: "web".to_string(),
            timestamp: ts,
            duration: 0.5,
            size: 4,
            status: 500,
            headers: BTreeMap::from([("content-type".to_string(), "text/plain".to_string())]),
            content: "oops".to_string(),
        };

        store
            .with_connection(false, |conn| save_snapshot(conn, &snap))
            .unwrap();

        let fetched = store
            .with_connection(true, |conn| get_snapshot(conn, &snap.id))
            .unwrap();
        assert_eq!(fetched, Some(snap.clone()));

        let refs = store
            .with_connection(true, |conn| {
                snapshots_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert_eq!(refs, vec![SnapshotRef::from(&snap)]);
    }

    #[test]
    fn test_error_rolls_back_and_discards_connection() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(store.idle_connections(false), 1);

        let res: Result<(), DbError> = store.with_connection(false, |conn| {
            save_check(conn, &result("web", ts, true))?;
            Err(DbError::Migration("boom".to_string()))
        });
        assert!(res.is_err());
        assert_eq!(store.idle_connections(false), 0);

        let rows = store
            .with_connection(true, |conn| {
                results_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert!(rows.is_empty());
        assert_eq!(store.idle_connections(true), 1);
    }

    #[test]
    fn test_connections_are_reused() {
        let (_dir, store) = open_store();
        for _ in 0..3 {
            store.with_connection(true, |_| Ok(())).unwrap();
            store.with_connection(false, |_| Ok(())).unwrap();
        }
        assert_eq!(store.idle_connections(true), 1);
        assert_eq!(store.idle_connections(false), 1);
    }

    #[test]
    fn test_all_time_stats() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        store
            .with_connection(false, |conn| {
                let mut a = result("web", ts, true);
                a.duration = 1.0;
                let mut b = result("web", ts + chrono::Duration::minutes(5), false);
                b.duration = 4.0;
                save_check(conn, &a)?;
                save_check(conn, &b)
            })
            .unwrap();

        let stats = store.with_connection(true, all_time_stats).unwrap();
        let web = stats["web"];
        assert_eq!(web.uptime, 0.5);
        assert!((web.latency - 2.0).abs() < 1e-9);
        assert_eq!(web.max_latency, 4.0);
    }

    #[test]
    fn test_epoch_conversion() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
            + chrono::Duration::microseconds(123_456);
        assert_eq!(from_epoch(to_epoch(ts)), Some(ts));
        assert_eq!(
            to_epoch(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()),
            1_704_110_400.0
        );
        assert_eq!(from_epoch(f64::INFINITY), None);
        assert_eq!(from_epoch(f64::NAN), None);
        assert_eq!(from_epoch(1e300), None);
    }

    #[test]
    fn test_out_of_range_timestamp_is_an_error() {
        let (_dir, store) = open_store();
        store
            .with_connection(false, |conn| {
                conn.execute(
                    "INSERT INTO snapshots VALUES ('far', 'web', 1e300, 0.5, 0, 500, '{}', '')",
                    [],
                )?;
                Ok(())
            })
            .unwrap();

        let fetched = store.with_connection(true, |conn| get_snapshot(conn, "far"));
        assert!(matches!(
            fetched,
            Err(DbError::Sqlite(rusqlite::Error::FromSqlConversionFailure(2, Type::Real, _)))
        ));
    }

    #[test]
    fn test_panic_in_scope_discards_connection_and_writes() {
        let (_dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(store.idle_connections(false), 1);

        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            store.with_connection(false, |conn| -> Result<(), DbError> {
                save_check(conn, &result("web", ts, true))?;
                panic!("scope panicked after writing");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(store.idle_connections(false), 0);

        let rows = store
            .with_connection(true, |conn| {
                results_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert!(rows.is_empty());

        // The store keeps working with a fresh connection.
        store
            .with_connection(false, |conn| save_check(conn, &result("web", ts, true)))
            .unwrap();
        assert_eq!(store.idle_connections(false), 1);
    }

    #[test]
    fn test_leftover_transaction_is_rolled_back_on_checkout() {
        let (dir, store) = open_store();
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();

        // A pooled connection left inside an open transaction with an
        // uncommitted insert.
        let dirty = open_connection(&dir.path().join("upcheck.db"), false).unwrap();
        dirty.execute_batch("BEGIN").unwrap();
        save_check(&dirty, &result("web", ts, true)).unwrap();
        assert!(!dirty.is_autocommit());
        store.checkin(false, dirty);

        // The most recently returned connection is handed out first.
        let (visible, idle) = store
            .with_connection(false, |conn| {
                let rows = results_between(conn, ts, ts + chrono::Duration::seconds(1))?;
                Ok(rows.len())
            })
            .map(|n| (n, store.idle_connections(false)))
            .unwrap();
        assert_eq!(visible, 0);
        assert_eq!(idle, 2);

        store
            .with_connection(false, |conn| save_check(conn, &result("web", ts, false)))
            .unwrap();
        let rows = store
            .with_connection(true, |conn| {
                results_between(conn, ts, ts + chrono::Duration::seconds(1))
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].passed);
    }
}
