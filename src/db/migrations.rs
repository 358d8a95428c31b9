//! Versioned schema migrations.
//!
//! The schema version lives in `PRAGMA user_version`. A freshly initialized
//! store starts at version 0 with the baseline schema below; every migration
//! numbered above the stored version is applied in order on startup.

use rusqlite::{Connection, OptionalExtension};

use super::store::DbError;

/// Schema written by `initialize`. Timestamps are ISO-8601 text here and are
/// converted to epoch seconds by migration 1.
pub(crate) const BASELINE_SCHEMA: &str = "
CREATE TABLE checks (
    check_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    duration REAL NOT NULL,
    size INTEGER NOT NULL,
    status INTEGER NOT NULL,
    passed BOOL NOT NULL,
    errors TEXT NOT NULL,
    PRIMARY KEY (check_name, timestamp)
);

CREATE TABLE snapshots (
    uuid TEXT NOT NULL,
    check_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    duration REAL NOT NULL,
    size INTEGER NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (uuid)
);

CREATE INDEX snapshots_name ON snapshots (check_name, timestamp);
";

/// Converts an ISO-8601 text column to epoch seconds, keeping milliseconds.
const TEXT_TO_EPOCH: &str = "ROUND((julianday(timestamp) - 2440587.5) * 86400000.0) / 1000.0";

/// A numbered schema change.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub statements: Vec<String>,
}

impl Migration {
    fn new(version: u32, description: &'static str, statements: Vec<String>) -> Self {
        Self {
            version,
            description,
            statements,
        }
    }

    fn apply(&self, conn: &mut Connection) -> Result<(), DbError> {
        let tx = conn.transaction()?;
        tx.execute_batch(&self.statements.join("\n"))?;
        tx.pragma_update(None, "user_version", self.version)?;
        tx.commit()?;
        Ok(())
    }
}

/// Rewrite `table` to a new column layout.
///
/// Copies every row into `<table>__new` using `select`, drops the old table,
/// renames the new one into place and finally runs `indexes`.
pub fn rebuild_table(table: &str, columns: &str, select: &str, indexes: &[&str]) -> Vec<String> {
    let mut statements = vec![
        format!("CREATE TABLE {table}__new {columns};"),
        format!("INSERT INTO {table}__new SELECT {select} FROM {table};"),
        format!("DROP TABLE {table};"),
        format!("ALTER TABLE {table}__new RENAME TO {table};"),
    ];
    statements.extend(indexes.iter().map(|idx| idx.to_string()));
    statements
}

/// All known migrations, ordered by version.
pub fn migrations() -> Vec<Migration> {
    let mut epoch_timestamps = rebuild_table(
        "checks",
        "(
            check_name TEXT NOT NULL,
            timestamp REAL NOT NULL,
            duration REAL NOT NULL,
            size INTEGER NOT NULL,
            status INTEGER NOT NULL,
            passed BOOL NOT NULL,
            errors TEXT NOT NULL,
            PRIMARY KEY (check_name, timestamp)
        )",
        &format!("check_name, {TEXT_TO_EPOCH}, duration, size, status, passed, errors"),
        &[],
    );
    epoch_timestamps.extend(rebuild_table(
        "snapshots",
        "(
            uuid TEXT NOT NULL,
            check_name TEXT NOT NULL,
            timestamp REAL NOT NULL,
            duration REAL NOT NULL,
            size INTEGER NOT NULL,
            status INTEGER NOT NULL,
            headers TEXT NOT NULL,
            content TEXT NOT NULL,
            PRIMARY KEY (uuid)
        )",
        &format!("uuid, check_name, {TEXT_TO_EPOCH}, duration, size, status, headers, content"),
        &["CREATE INDEX snapshots_name ON snapshots (check_name, timestamp);"],
    ));

    vec![
        Migration::new(1, "store timestamps as epoch seconds", epoch_timestamps),
        Migration::new(
            2,
            "index checks by timestamp",
            vec!["CREATE INDEX checks_timestamp ON checks (timestamp);".to_string()],
        ),
    ]
}

/// Highest version known to this build.
pub fn latest_version() -> u32 {
    migrations().last().map(|m| m.version).unwrap_or(0)
}

/// Read the stored schema version.
pub fn schema_version(conn: &Connection) -> Result<u32, DbError> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}

/// Apply every pending migration and return the resulting schema version.
///
/// Refuses to touch a store whose version is newer than this build, or one
/// that still holds a `__new` table left behind by an interrupted rebuild.
pub fn apply_migrations(conn: &mut Connection) -> Result<u32, DbError> {
    let current = schema_version(conn)?;
    let latest = latest_version();
    if current > latest {
        return Err(DbError::Migration(format!(
            "store is at schema version {current}, newer than the latest known version {latest}"
        )));
    }

    let leftover: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%\\_\\_new' ESCAPE '\\'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(table) = leftover {
        return Err(DbError::Migration(format!(
            "found table {table} from an interrupted migration, manual repair required"
        )));
    }

    let mut version = current;
    for migration in migrations().iter().filter(|m| m.version > current) {
        tracing::info!(
            "Updating database to version {} ({})",
            migration.version,
            migration.description
        );
        migration.apply(conn).map_err(|e| {
            DbError::Migration(format!("migration {} failed: {}", migration.version, e))
        })?;
        version = migration.version;
    }

    Ok(version)
}
