// ABOUTME: On-disk layout of the record table and its forward-only migrations.
// ABOUTME: Schema version lives in PRAGMA user_version; migrations run in one transaction.

use rusqlite::{Connection, TransactionBehavior};
use thiserror::Error;

/// Ordered migrations. Entry N brings the file from version N to N+1.
const MIGRATIONS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS record (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        entered_at TEXT NOT NULL,
        updated_at TEXT,
        schema_version TEXT NOT NULL,
        data TEXT NOT NULL,
        occurred_from TEXT NOT NULL,
        occurred_to TEXT NOT NULL,
        latitude REAL,
        longitude REAL,
        weather TEXT,
        light TEXT,
        CHECK ((latitude IS NULL) = (longitude IS NULL))
    );",
    "CREATE INDEX IF NOT EXISTS idx_record_entered_at ON record (entered_at DESC, id DESC);",
];

/// The schema version this build writes.
pub const CURRENT_VERSION: i64 = MIGRATIONS.len() as i64;

/// Errors that can occur while preparing the schema.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database schema version {found} is newer than supported version {supported}")]
    TooNew { found: i64, supported: i64 },

    #[error("database schema version {found} is not a valid version")]
    InvalidVersion { found: i64 },
}

/// Read the schema version recorded in the file.
pub fn version(conn: &Connection) -> Result<i64, SchemaError> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

/// Bring the file up to CURRENT_VERSION. Either every pending migration
/// applies or none do. Returns the number of migrations applied.
pub fn migrate(conn: &mut Connection) -> Result<usize, SchemaError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let found: i64 = tx.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if found > CURRENT_VERSION {
        return Err(SchemaError::TooNew {
            found,
            supported: CURRENT_VERSION,
        });
    }

    let start = usize::try_from(found).map_err(|_| SchemaError::InvalidVersion { found })?;
    let pending = &MIGRATIONS[start..];
    for (offset, sql) in pending.iter().enumerate() {
        let to = found + offset as i64 + 1;
        tracing::info!(from = to - 1, to, "applying record schema migration");
        tx.execute_batch(sql)?;
    }

    if !pending.is_empty() {
        tx.execute_batch(&format!("PRAGMA user_version = {CURRENT_VERSION};"))?;
    }
    tx.commit()?;

    Ok(pending.len())
}
