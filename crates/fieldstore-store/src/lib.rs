// ABOUTME: Persistence layer for fieldstore, storing records in a single SQLite table.
// ABOUTME: Provides the record store, schema migrations, store clock, and configuration.

pub mod clock;
pub mod config;
pub mod schema;
pub mod sqlite;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, StoreConfig};
pub use schema::SchemaError;
pub use sqlite::{
    LoadIssue, LoadedRecord, RecordCursor, RecordLookup, RecordStore, RecordSummary, StoreError,
};
