// ABOUTME: SQLite-backed record store with transactional add, update, delete, and reads.
// ABOUTME: Holds one write handle and one query-only read handle for the life of the process.

use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fieldstore_core::codec::{self, CodecError};
use fieldstore_core::constants::{
    ConstantFields, Light, Location, UnknownEnumToken, Weather, format_timestamp, parse_timestamp,
    truncate_to_seconds,
};
use fieldstore_core::record::{Record, RecordId};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, Transaction, TransactionBehavior, params};
use serde::Serialize;
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::config::StoreConfig;
use crate::schema::{self, SchemaError};

/// Errors that can occur during record store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open record store at {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// The transaction was rolled back in full; nothing was written.
    #[error("record {op} failed and was rolled back: {source}")]
    WriteFailed {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    #[error("record read failed: {0}")]
    Read(#[from] rusqlite::Error),

    /// A write touched a row count that is impossible for a unique id.
    #[error("identity consistency violation: {op} of record {id} affected {affected} rows")]
    IdentityConsistency {
        op: &'static str,
        id: RecordId,
        affected: usize,
    },

    #[error("record {id} has unparseable {column}: {value:?}")]
    CorruptColumn {
        id: RecordId,
        column: &'static str,
        value: String,
    },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The record's body failed to load, so saving it would replace the
    /// stored text. Recover the raw data or re-enter the record first.
    #[error("record {id:?} has no decoded body; refusing to overwrite its stored data")]
    MissingBody { id: Option<RecordId> },

    #[error("record store handle lock poisoned")]
    Poisoned,
}

fn write_failed(op: &'static str) -> impl FnOnce(rusqlite::Error) -> StoreError {
    move |source| {
        tracing::error!(op, error = %source, "record write failed, rolling back");
        StoreError::WriteFailed { op, source }
    }
}

fn identity_violation(op: &'static str, id: RecordId, affected: usize) -> StoreError {
    tracing::error!(op, %id, affected, "record identity consistency violation");
    StoreError::IdentityConsistency { op, id, affected }
}

/// Something wrong with a stored row that still let it load.
#[derive(Debug)]
pub enum LoadIssue {
    /// The body text did not decode; the record's body is None.
    MalformedBody(CodecError),
    /// A weather or light token outside the closed set; that field is None.
    UnknownToken(UnknownEnumToken),
}

/// A record read back from the store, with anything that went wrong
/// decoding it.
#[derive(Debug)]
pub struct LoadedRecord {
    pub record: Record,
    /// The body text exactly as stored, kept for recovery of corrupt rows.
    pub raw_data: String,
    pub issues: Vec<LoadIssue>,
}

impl LoadedRecord {
    /// True when the row exists but its body could not be decoded.
    pub fn is_corrupt(&self) -> bool {
        self.body_error().is_some()
    }

    pub fn body_error(&self) -> Option<&CodecError> {
        self.issues.iter().find_map(|issue| match issue {
            LoadIssue::MalformedBody(err) => Some(err),
            LoadIssue::UnknownToken(_) => None,
        })
    }

    pub fn unknown_tokens(&self) -> impl Iterator<Item = &UnknownEnumToken> {
        self.issues.iter().filter_map(|issue| match issue {
            LoadIssue::UnknownToken(token) => Some(token),
            LoadIssue::MalformedBody(_) => None,
        })
    }
}

/// Result of looking a record up by id.
#[derive(Debug)]
pub enum RecordLookup {
    Found(LoadedRecord),
    NotFound,
}

impl RecordLookup {
    pub fn found(self) -> Option<LoadedRecord> {
        match self {
            RecordLookup::Found(loaded) => Some(loaded),
            RecordLookup::NotFound => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RecordLookup::NotFound)
    }
}

/// Summary of a record for list views and upload queues.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordSummary {
    pub id: RecordId,
    pub schema_version: String,
    pub entered_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub occurred_from: DateTime<Utc>,
}

/// Constant fields flattened into column values.
struct ConstantColumns {
    occurred: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    weather: Option<&'static str>,
    light: Option<&'static str>,
}

impl From<&ConstantFields> for ConstantColumns {
    fn from(constants: &ConstantFields) -> Self {
        Self {
            // occurred_to is always written from occurred_from
            occurred: format_timestamp(&constants.occurred_from),
            latitude: constants.location.map(|l| l.latitude),
            longitude: constants.location.map(|l| l.longitude),
            weather: constants.weather.map(|w| w.as_token()),
            light: constants.light.map(|l| l.as_token()),
        }
    }
}

const SELECT_RECORD: &str = "SELECT id, entered_at, updated_at, schema_version, data,
        occurred_from, occurred_to, latitude, longitude, weather, light
     FROM record";

/// A full row as stored, before any decoding.
struct StoredRow {
    id: RecordId,
    entered_at: String,
    updated_at: Option<String>,
    schema_version: String,
    data: String,
    occurred_from: String,
    occurred_to: String,
    latitude: Option<f64>,
    longitude: Option<f64>,
    weather: Option<String>,
    light: Option<String>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: RecordId(row.get(0)?),
            entered_at: row.get(1)?,
            updated_at: row.get(2)?,
            schema_version: row.get(3)?,
            data: row.get(4)?,
            occurred_from: row.get(5)?,
            occurred_to: row.get(6)?,
            latitude: row.get(7)?,
            longitude: row.get(8)?,
            weather: row.get(9)?,
            light: row.get(10)?,
        })
    }

    fn into_loaded(self) -> Result<LoadedRecord, StoreError> {
        let id = self.id;
        let mut issues = Vec::new();

        let entered_at = parse_column(id, "entered_at", &self.entered_at)?;
        let updated_at = self
            .updated_at
            .as_deref()
            .map(|text| parse_column(id, "updated_at", text))
            .transpose()?;

        let location = match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Location {
                latitude,
                longitude,
            }),
            (None, None) => None,
            _ => {
                tracing::warn!(%id, "record has half a location, treating as absent");
                None
            }
        };

        let weather = decode_token(id, self.weather.as_deref(), Weather::from_token, &mut issues);
        let light = decode_token(id, self.light.as_deref(), Light::from_token, &mut issues);

        let constants = ConstantFields {
            occurred_from: parse_column(id, "occurred_from", &self.occurred_from)?,
            occurred_to: parse_column(id, "occurred_to", &self.occurred_to)?,
            location,
            weather,
            light,
        };

        let body = match codec::deserialize(&self.data, Some(&self.schema_version)) {
            Ok(body) => Some(body),
            Err(err) => {
                tracing::warn!(%id, error = %err, "failed to deserialize record data");
                issues.push(LoadIssue::MalformedBody(err));
                None
            }
        };

        Ok(LoadedRecord {
            record: Record::from_stored(
                id,
                self.schema_version,
                body,
                constants,
                entered_at,
                updated_at,
            ),
            raw_data: self.data,
            issues,
        })
    }
}

fn parse_column(id: RecordId, column: &'static str, text: &str) -> Result<DateTime<Utc>, StoreError> {
    parse_timestamp(text).map_err(|_| StoreError::CorruptColumn {
        id,
        column,
        value: text.to_string(),
    })
}

fn decode_token<T>(
    id: RecordId,
    token: Option<&str>,
    parse: fn(&str) -> Result<T, UnknownEnumToken>,
    issues: &mut Vec<LoadIssue>,
) -> Option<T> {
    match parse(token?) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::warn!(%id, kind = err.kind, token = %err.token, "unknown stored enum token");
            issues.push(LoadIssue::UnknownToken(err));
            None
        }
    }
}

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// The record store. Opens the database once, keeps a write handle and a
/// read handle open until dropped, and wraps every write in one
/// transaction. Reads never observe a partially written row.
pub struct RecordStore {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    clock: Arc<dyn Clock>,
    page_size: usize,
}

impl RecordStore {
    /// Open or create the store described by `config`, migrating the schema
    /// to the current version.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_with_clock(config, Arc::new(SystemClock))
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(&StoreConfig::in_memory())
    }

    /// Open with an explicit time source for entered_at/updated_at.
    pub fn open_with_clock(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let target = if config.in_memory {
            tracing::warn!("record store is using an in-memory database; this should only happen in testing");
            flags |= OpenFlags::SQLITE_OPEN_URI;
            // Both handles must reach the same database, so it is a named
            // shared-cache memory database rather than a bare ":memory:".
            format!(
                "file:fieldstore-mem-{}-{}?mode=memory&cache=shared",
                std::process::id(),
                MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
            )
        } else {
            fs::create_dir_all(&config.home)?;
            config.db_path().to_string_lossy().into_owned()
        };

        let open = |flags: OpenFlags| -> Result<Connection, StoreError> {
            let conn = Connection::open_with_flags(&target, flags).map_err(|source| StoreError::Open {
                target: target.clone(),
                source,
            })?;
            conn.busy_timeout(busy_timeout)?;
            Ok(conn)
        };

        let mut writer = open(flags)?;
        if !config.in_memory {
            writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        }
        let applied = schema::migrate(&mut writer)?;

        let reader = open(flags)?;
        reader.execute_batch("PRAGMA query_only = ON;")?;

        tracing::info!(
            db = %target,
            schema_version = schema::CURRENT_VERSION,
            migrations_applied = applied,
            "record store opened"
        );

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            clock,
            page_size: config.page_size.max(1),
        })
    }

    fn writer(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.writer.lock().map_err(|_| StoreError::Poisoned)
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.reader.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Run `body` inside one IMMEDIATE transaction. Commits if it returns
    /// Ok; any error drops the transaction, which rolls it back.
    fn write<T>(
        &self,
        op: &'static str,
        body: impl FnOnce(&Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.writer()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(write_failed(op))?;
        let out = body(&tx)?;
        tx.commit().map_err(write_failed(op))?;
        Ok(out)
    }

    fn insert(
        &self,
        schema_version: &str,
        data: &str,
        constants: &ConstantFields,
    ) -> Result<(RecordId, DateTime<Utc>), StoreError> {
        let now = self.clock.now();
        let entered_at = format_timestamp(&now);
        let cols = ConstantColumns::from(constants);

        let id = self.write("add", |tx| {
            tx.execute(
                "INSERT INTO record (entered_at, schema_version, data, occurred_from, occurred_to,
                    latitude, longitude, weather, light)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entered_at,
                    schema_version,
                    data,
                    cols.occurred,
                    cols.occurred,
                    cols.latitude,
                    cols.longitude,
                    cols.weather,
                    cols.light,
                ],
            )
            .map_err(write_failed("add"))?;
            Ok(RecordId(tx.last_insert_rowid()))
        })?;

        tracing::debug!(%id, schema_version, "record added");
        Ok((id, now))
    }

    fn replace(
        &self,
        id: RecordId,
        data: &str,
        constants: &ConstantFields,
    ) -> Result<(usize, DateTime<Utc>), StoreError> {
        let now = self.clock.now();
        let updated_at = format_timestamp(&now);
        let cols = ConstantColumns::from(constants);

        let affected = self.write("update", |tx| {
            let affected = tx
                .execute(
                    "UPDATE record SET data = ?1, occurred_from = ?2, occurred_to = ?3,
                        latitude = ?4, longitude = ?5, weather = ?6, light = ?7, updated_at = ?8
                     WHERE id = ?9",
                    params![
                        data,
                        cols.occurred,
                        cols.occurred,
                        cols.latitude,
                        cols.longitude,
                        cols.weather,
                        cols.light,
                        updated_at,
                        id.0,
                    ],
                )
                .map_err(write_failed("update"))?;
            if affected > 1 {
                return Err(identity_violation("update", id, affected));
            }
            Ok(affected)
        })?;

        if affected == 0 {
            tracing::warn!(%id, "update matched no record");
        } else {
            tracing::debug!(%id, "record updated");
        }
        Ok((affected, now))
    }

    /// Insert a new record from already-serialized body text. Stamps
    /// entered_at from the store clock and returns the new id.
    pub fn add(
        &self,
        schema_version: &str,
        data: &str,
        constants: &ConstantFields,
    ) -> Result<RecordId, StoreError> {
        self.insert(schema_version, data, constants).map(|(id, _)| id)
    }

    /// Replace the body and every constant field of an existing record and
    /// refresh updated_at. schema_version and entered_at are untouched.
    /// Returns 0 if the record no longer exists, 1 otherwise.
    pub fn update(
        &self,
        id: RecordId,
        data: &str,
        constants: &ConstantFields,
    ) -> Result<usize, StoreError> {
        self.replace(id, data, constants).map(|(affected, _)| affected)
    }

    /// Remove one record, typically after it has been uploaded. Returns
    /// false if there was no such record.
    pub fn delete(&self, id: RecordId) -> Result<bool, StoreError> {
        let affected = self.write("delete", |tx| {
            let affected = tx
                .execute("DELETE FROM record WHERE id = ?1", params![id.0])
                .map_err(write_failed("delete"))?;
            if affected > 1 {
                return Err(identity_violation("delete", id, affected));
            }
            Ok(affected)
        })?;

        if affected == 1 {
            tracing::debug!(%id, "record deleted");
            Ok(true)
        } else {
            tracing::warn!(%id, "delete matched no record");
            Ok(false)
        }
    }

    /// Persist an in-memory record: insert it if it has no id yet, otherwise
    /// update it. On success the record carries its id and fresh timestamps.
    pub fn save(&self, record: &mut Record) -> Result<RecordId, StoreError> {
        if record.body.is_none() {
            tracing::warn!(id = ?record.id, "refusing to save record without a decoded body");
            return Err(StoreError::MissingBody { id: record.id });
        }
        let data = record.serialized_body()?;
        record.constants = record.constants.normalized();

        match record.id {
            None => {
                let (id, entered_at) =
                    self.insert(record.schema_version(), &data, &record.constants)?;
                record.id = Some(id);
                record.entered_at = Some(truncate_to_seconds(entered_at));
                Ok(id)
            }
            Some(id) => {
                let (affected, updated_at) = self.replace(id, &data, &record.constants)?;
                if affected == 0 {
                    return Err(identity_violation("save", id, affected));
                }
                record.updated_at = Some(truncate_to_seconds(updated_at));
                Ok(id)
            }
        }
    }

    /// Load one record with its constants and decoded body.
    pub fn get_by_id(&self, id: RecordId) -> Result<RecordLookup, StoreError> {
        let row = {
            let conn = self.reader()?;
            conn.query_row(
                &format!("{SELECT_RECORD} WHERE id = ?1"),
                params![id.0],
                StoredRow::from_row,
            )
            .optional()?
        };

        match row {
            Some(row) => Ok(RecordLookup::Found(row.into_loaded()?)),
            None => {
                tracing::debug!(%id, "record not found");
                Ok(RecordLookup::NotFound)
            }
        }
    }

    /// The body text of one record exactly as stored.
    pub fn get_serialized(&self, id: RecordId) -> Result<Option<String>, StoreError> {
        let conn = self.reader()?;
        Ok(conn
            .query_row("SELECT data FROM record WHERE id = ?1", params![id.0], |row| {
                row.get(0)
            })
            .optional()?)
    }

    /// Number of stored records.
    pub fn count(&self) -> Result<u64, StoreError> {
        let conn = self.reader()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM record", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// All records, most recently entered first. Rows are fetched lazily a
    /// page at a time, so iteration does not hold the read handle between
    /// pages and never blocks the writer.
    pub fn list_all(&self) -> RecordCursor<'_> {
        RecordCursor {
            store: self,
            buffer: VecDeque::new(),
            after: None,
            exhausted: false,
        }
    }

    fn fetch_page(
        &self,
        after: Option<&(String, i64)>,
    ) -> Result<Vec<(String, RecordSummary)>, StoreError> {
        let conn = self.reader()?;
        let mut stmt = conn.prepare_cached(
            "SELECT id, entered_at, updated_at, schema_version, occurred_from
             FROM record
             WHERE ?1 IS NULL OR entered_at < ?1 OR (entered_at = ?1 AND id < ?2)
             ORDER BY entered_at DESC, id DESC
             LIMIT ?3",
        )?;

        let (after_entered, after_id) = match after {
            Some((entered, id)) => (Some(entered.as_str()), *id),
            None => (None, 0),
        };

        let rows = stmt.query_map(
            params![after_entered, after_id, self.page_size as i64],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            },
        )?;

        let mut page = Vec::new();
        for row in rows {
            let (id, entered_at, updated_at, schema_version, occurred_from) = row?;
            let id = RecordId(id);
            let summary = RecordSummary {
                id,
                schema_version,
                entered_at: parse_column(id, "entered_at", &entered_at)?,
                updated_at: updated_at
                    .as_deref()
                    .map(|text| parse_column(id, "updated_at", text))
                    .transpose()?,
                occurred_from: parse_column(id, "occurred_from", &occurred_from)?,
            };
            page.push((entered_at, summary));
        }
        Ok(page)
    }
}

/// Lazy iterator over record summaries, newest first. Pages are read with
/// keyset pagination on (entered_at, id).
pub struct RecordCursor<'a> {
    store: &'a RecordStore,
    buffer: VecDeque<RecordSummary>,
    after: Option<(String, i64)>,
    exhausted: bool,
}

impl Iterator for RecordCursor<'_> {
    type Item = Result<RecordSummary, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            match self.store.fetch_page(self.after.as_ref()) {
                Ok(page) => {
                    if page.len() < self.store.page_size {
                        self.exhausted = true;
                    }
                    if let Some((entered_at, summary)) = page.last() {
                        self.after = Some((entered_at.clone(), summary.id.0));
                    }
                    self.buffer.extend(page.into_iter().map(|(_, summary)| summary));
                }
                Err(err) => {
                    self.exhausted = true;
                    return Some(Err(err));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn store_with_clock(page_size: usize) -> (RecordStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 2, 1, 9, 0, 0).unwrap()));
        let config = StoreConfig {
            page_size,
            ..StoreConfig::in_memory()
        };
        let store = RecordStore::open_with_clock(&config, clock.clone()).unwrap();
        (store, clock)
    }

    fn body_text(value: serde_json::Value) -> String {
        codec::serialize(&value).unwrap()
    }

    #[test]
    fn add_then_get_round_trips() {
        let store = RecordStore::open_in_memory().unwrap();
        let constants = ConstantFields::new(t0()).with_weather(Weather::Clear);

        let id = store
            .add("v1", &body_text(json!({"Name": "Evel Knievel"})), &constants)
            .unwrap();
        assert!(id.0 >= 1);

        let loaded = store.get_by_id(id).unwrap().found().expect("record exists");
        assert!(loaded.issues.is_empty());
        let record = loaded.record;
        assert_eq!(record.id, Some(id));
        assert_eq!(record.schema_version(), "v1");
        assert_eq!(record.body, Some(json!({"Name": "Evel Knievel"})));
        assert_eq!(record.constants.weather, Some(Weather::Clear));
        assert_eq!(record.constants.occurred_from, t0());
        assert_eq!(record.constants.occurred_to, record.constants.occurred_from);
        assert!(record.constants.location.is_none());
        assert!(record.constants.light.is_none());
        assert!(record.updated_at.is_none());
    }

    #[test]
    fn occurred_to_always_mirrors_occurred_from() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut constants = ConstantFields::new(t0());
        constants.occurred_to = t0() + chrono::Duration::days(3);

        let id = store.add("v1", "{}", &constants).unwrap();
        let record = store.get_by_id(id).unwrap().found().unwrap().record;
        assert_eq!(record.constants.occurred_to, t0());
    }

    #[test]
    fn zero_location_is_not_absent() {
        let store = RecordStore::open_in_memory().unwrap();

        let with_zero = ConstantFields::new(t0()).with_location(Location::new(0.0, 0.0));
        let zero_id = store.add("v1", "{}", &with_zero).unwrap();
        let none_id = store.add("v1", "{}", &ConstantFields::new(t0())).unwrap();

        let zero = store.get_by_id(zero_id).unwrap().found().unwrap().record;
        let none = store.get_by_id(none_id).unwrap().found().unwrap().record;
        assert_eq!(zero.constants.location, Some(Location::new(0.0, 0.0)));
        assert_eq!(none.constants.location, None);
    }

    #[test]
    fn update_replaces_body_and_constants() {
        let (store, clock) = store_with_clock(64);
        let id = store
            .add("v1", &body_text(json!({"Name": "A"})), &ConstantFields::new(t0()))
            .unwrap();
        let before = store.get_by_id(id).unwrap().found().unwrap().record;

        clock.advance(chrono::Duration::minutes(5));
        let later = t0() + chrono::Duration::hours(1);
        let constants = ConstantFields::new(later)
            .with_location(Location::new(14.5995, 120.9842))
            .with_light(Light::Night);
        let affected = store
            .update(id, &body_text(json!({"Name": "B", "Vehicle": []})), &constants)
            .unwrap();
        assert_eq!(affected, 1);

        let after = store.get_by_id(id).unwrap().found().unwrap().record;
        assert_eq!(after.body, Some(json!({"Name": "B", "Vehicle": []})));
        assert_eq!(after.constants, constants);
        assert_eq!(after.schema_version(), "v1");
        assert_eq!(after.entered_at, before.entered_at);
        assert_eq!(
            after.updated_at,
            Some(Utc.with_ymd_and_hms(2024, 2, 1, 9, 5, 0).unwrap())
        );
        assert!(after.updated_at > after.entered_at);
    }

    #[test]
    fn update_missing_record_is_a_no_op() {
        let store = RecordStore::open_in_memory().unwrap();
        let affected = store
            .update(RecordId(99999), "{}", &ConstantFields::new(t0()))
            .unwrap();
        assert_eq!(affected, 0);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn delete_reports_absence() {
        let store = RecordStore::open_in_memory().unwrap();
        let id = store.add("v1", "{}", &ConstantFields::new(t0())).unwrap();

        assert!(store.delete(id).unwrap());
        assert!(!store.delete(id).unwrap());
        assert!(store.get_by_id(id).unwrap().is_not_found());
        assert_eq!(store.get_serialized(id).unwrap(), None);
    }

    #[test]
    fn corrupt_body_still_loads_constants() {
        let store = RecordStore::open_in_memory().unwrap();
        let constants = ConstantFields::new(t0()).with_weather(Weather::Fog);
        let id = store.add("v1", r#"{"Name": "Evel Kn"#, &constants).unwrap();

        let loaded = match store.get_by_id(id).unwrap() {
            RecordLookup::Found(loaded) => loaded,
            RecordLookup::NotFound => panic!("corrupt record must not read as missing"),
        };
        assert!(loaded.is_corrupt());
        assert!(matches!(
            loaded.body_error(),
            Some(CodecError::Malformed { .. })
        ));
        assert_eq!(loaded.raw_data, r#"{"Name": "Evel Kn"#);
        assert!(loaded.record.body.is_none());
        assert_eq!(loaded.record.constants.weather, Some(Weather::Fog));
        assert_eq!(loaded.record.constants.occurred_from, t0());
    }

    #[test]
    fn unknown_token_loads_with_field_absent() {
        let store = RecordStore::open_in_memory().unwrap();
        let constants = ConstantFields::new(t0())
            .with_weather(Weather::Rain)
            .with_light(Light::Day);
        let id = store.add("v1", "{}", &constants).unwrap();

        store
            .writer
            .lock()
            .unwrap()
            .execute("UPDATE record SET weather = 'SUNNY' WHERE id = ?1", params![id.0])
            .unwrap();

        let loaded = store.get_by_id(id).unwrap().found().unwrap();
        assert!(!loaded.is_corrupt());
        assert_eq!(loaded.record.constants.weather, None);
        assert_eq!(loaded.record.constants.light, Some(Light::Day));
        let tokens: Vec<_> = loaded.unknown_tokens().collect();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, "weather");
        assert_eq!(tokens[0].token, "SUNNY");
    }

    #[test]
    fn corrupt_timestamp_is_a_read_error() {
        let store = RecordStore::open_in_memory().unwrap();
        let id = store.add("v1", "{}", &ConstantFields::new(t0())).unwrap();
        store
            .writer
            .lock()
            .unwrap()
            .execute("UPDATE record SET occurred_from = 'last tuesday' WHERE id = ?1", params![id.0])
            .unwrap();

        let err = store.get_by_id(id).unwrap_err();
        assert!(matches!(
            err,
            StoreError::CorruptColumn { column: "occurred_from", .. }
        ));
    }

    #[test]
    fn failed_insert_rolls_back() {
        let store = RecordStore::open_in_memory().unwrap();
        store
            .writer
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_bad BEFORE INSERT ON record
                 WHEN NEW.schema_version = 'bad'
                 BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
            )
            .unwrap();

        let err = store.add("bad", "{}", &ConstantFields::new(t0())).unwrap_err();
        assert!(matches!(err, StoreError::WriteFailed { op: "add", .. }));
        assert_eq!(store.count().unwrap(), 0);

        // The store stays usable after a rolled back write.
        store.add("v1", "{}", &ConstantFields::new(t0())).unwrap();
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn list_all_is_newest_first_across_pages() {
        let (store, clock) = store_with_clock(2);
        let mut ids = Vec::new();
        for i in 0..5 {
            ids.push(
                store
                    .add("v1", &body_text(json!({"n": i})), &ConstantFields::new(t0()))
                    .unwrap(),
            );
            // two records share each second to exercise the id tiebreak
            if i % 2 == 1 {
                clock.advance(chrono::Duration::seconds(1));
            }
        }

        let listed: Vec<RecordSummary> = store.list_all().collect::<Result<_, _>>().unwrap();
        let listed_ids: Vec<RecordId> = listed.iter().map(|s| s.id).collect();
        ids.reverse();
        assert_eq!(listed_ids, ids);

        for pair in listed.windows(2) {
            assert!(pair[0].entered_at >= pair[1].entered_at);
        }
    }

    #[test]
    fn list_all_empty_store() {
        let store = RecordStore::open_in_memory().unwrap();
        assert_eq!(store.list_all().count(), 0);
    }

    #[test]
    fn save_inserts_then_updates() {
        let (store, clock) = store_with_clock(64);
        let mut record = Record::new("uuid-1", json!({"Name": "Evel"}), ConstantFields::new(t0()));

        let id = store.save(&mut record).unwrap();
        assert_eq!(record.id, Some(id));
        assert_eq!(record.entered_at, Some(clock.now()));

        clock.advance(chrono::Duration::seconds(30));
        record.body = Some(json!({"Name": "Robbie"}));
        assert_eq!(store.save(&mut record).unwrap(), id);
        assert_eq!(record.updated_at, Some(clock.now()));

        let stored = store.get_by_id(id).unwrap().found().unwrap().record;
        assert_eq!(stored, record);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn save_of_vanished_record_is_an_identity_error() {
        let store = RecordStore::open_in_memory().unwrap();
        let mut record = Record::new("v1", json!({}), ConstantFields::new(t0()));
        let id = store.save(&mut record).unwrap();
        store.delete(id).unwrap();

        let err = store.save(&mut record).unwrap_err();
        assert!(matches!(
            err,
            StoreError::IdentityConsistency { op: "save", affected: 0, .. }
        ));
    }

    #[test]
    fn save_refuses_corrupt_body_and_keeps_raw_data() {
        let store = RecordStore::open_in_memory().unwrap();
        let raw = r#"{"Name": "Evel Kn"#;
        let id = store.add("v1", raw, &ConstantFields::new(t0())).unwrap();

        let mut record = store.get_by_id(id).unwrap().found().unwrap().record;
        assert!(record.body.is_none());
        record.constants.weather = Some(Weather::Snow);

        let err = store.save(&mut record).unwrap_err();
        assert!(matches!(err, StoreError::MissingBody { id: Some(found) } if found == id));
        assert_eq!(store.get_serialized(id).unwrap().as_deref(), Some(raw));

        // Re-entering the body makes the record saveable again.
        record.body = Some(json!({"Name": "Evel Knievel"}));
        store.save(&mut record).unwrap();
        assert_eq!(
            store.get_serialized(id).unwrap().as_deref(),
            Some(r#"{"Name":"Evel Knievel"}"#)
        );
    }

    #[test]
    fn same_second_update_stores_equal_timestamps() {
        let (store, _clock) = store_with_clock(64);
        let id = store.add("v1", "{}", &ConstantFields::new(t0())).unwrap();
        store.update(id, "{}", &ConstantFields::new(t0())).unwrap();

        let record = store.get_by_id(id).unwrap().found().unwrap().record;
        assert_eq!(record.updated_at, record.entered_at);
    }

    #[test]
    fn open_refuses_negative_schema_version() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path());
        {
            let conn = Connection::open(config.db_path()).unwrap();
            conn.execute_batch("PRAGMA user_version = -1;").unwrap();
        }

        let err = RecordStore::open(&config).err().expect("open must fail");
        assert!(matches!(
            err,
            StoreError::Schema(SchemaError::InvalidVersion { found: -1 })
        ));
    }

    #[test]
    fn in_memory_reader_fails_fast_during_open_write() {
        let store = RecordStore::open_in_memory().unwrap();
        let writer = store.writer.lock().unwrap();
        writer
            .execute_batch(
                "BEGIN IMMEDIATE;
                 INSERT INTO record (entered_at, schema_version, data, occurred_from, occurred_to)
                 VALUES ('2024-01-01 00:00:00', 'v1', '{}', '2024-01-01 00:00:00', '2024-01-01 00:00:00');",
            )
            .unwrap();

        assert!(matches!(store.count(), Err(StoreError::Read(_))));

        writer.execute_batch("ROLLBACK;").unwrap();
        drop(writer);
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig::at(dir.path().join("data"));

        let id = {
            let store = RecordStore::open(&config).unwrap();
            store
                .add("v1", &body_text(json!({"Name": "Evel"})), &ConstantFields::new(t0()))
                .unwrap()
        };

        let store = RecordStore::open(&config).unwrap();
        assert_eq!(
            store.get_serialized(id).unwrap().as_deref(),
            Some(r#"{"Name":"Evel"}"#)
        );
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn open_fails_when_home_is_a_file() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("not_a_dir");
        fs::write(&home, "x").unwrap();

        let result = RecordStore::open(&StoreConfig::at(&home));
        assert!(result.is_err());
    }

    #[test]
    fn readers_see_only_committed_rows_during_writes() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig {
            page_size: 3,
            ..StoreConfig::at(dir.path())
        };
        let store = RecordStore::open(&config).unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..50 {
                    store
                        .add("v1", &body_text(json!({"n": i})), &ConstantFields::new(t0()))
                        .unwrap();
                }
            });
            scope.spawn(|| {
                for _ in 0..20 {
                    for summary in store.list_all() {
                        let summary = summary.unwrap();
                        let loaded = store.get_by_id(summary.id).unwrap().found().unwrap();
                        assert!(!loaded.is_corrupt());
                    }
                }
            });
        });

        assert_eq!(store.count().unwrap(), 50);
    }

    #[test]
    fn in_memory_stores_are_isolated() {
        let a = RecordStore::open_in_memory().unwrap();
        let b = RecordStore::open_in_memory().unwrap();
        a.add("v1", "{}", &ConstantFields::new(t0())).unwrap();
        assert_eq!(a.count().unwrap(), 1);
        assert_eq!(b.count().unwrap(), 0);
    }
}
