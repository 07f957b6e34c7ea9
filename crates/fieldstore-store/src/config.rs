// ABOUTME: Configuration loading for the record store.
// ABOUTME: Reads FIELDSTORE_* environment variables and validates numeric settings.

use std::path::PathBuf;

use thiserror::Error;

pub const DEFAULT_DB_NAME: &str = "driverdb";
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_PAGE_SIZE: usize = 64;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid number: {value}")]
    InvalidNumber { var: &'static str, value: String },

    #[error("FIELDSTORE_PAGE_SIZE must be at least 1")]
    ZeroPageSize,
}

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub home: PathBuf,
    pub db_name: String,
    /// Private in-memory database. Testing only: its two handles share one
    /// cache, and a read that meets an open write transaction fails at once
    /// with SQLITE_LOCKED instead of waiting out the busy timeout.
    pub in_memory: bool,
    pub busy_timeout_ms: u64,
    pub page_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            home: default_home(),
            db_name: DEFAULT_DB_NAME.to_string(),
            in_memory: false,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

fn default_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
        .join(".fieldstore")
}

fn parse_number<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber { var, value }),
        _ => Ok(default),
    }
}

impl StoreConfig {
    /// Configuration for a file-backed store under `home`.
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self {
            home: home.into(),
            ..Self::default()
        }
    }

    /// Configuration for a private in-memory store. Reads do not run
    /// alongside writes here; use a file-backed store when they must.
    pub fn in_memory() -> Self {
        Self {
            in_memory: true,
            ..Self::default()
        }
    }

    /// Full path of the database file.
    pub fn db_path(&self) -> PathBuf {
        self.home.join(&self.db_name)
    }

    /// Load configuration from environment variables with sensible defaults.
    ///
    /// Environment variables:
    /// - FIELDSTORE_HOME: data directory (default: ~/.fieldstore)
    /// - FIELDSTORE_DB_NAME: database file name (default: driverdb)
    /// - FIELDSTORE_IN_MEMORY: use an in-memory database (default: false)
    /// - FIELDSTORE_BUSY_TIMEOUT_MS: lock wait bound (default: 5000)
    /// - FIELDSTORE_PAGE_SIZE: rows per list page (default: 64)
    pub fn from_env() -> Result<Self, ConfigError> {
        let home = std::env::var("FIELDSTORE_HOME")
            .ok()
            .filter(|h| !h.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(default_home);

        let db_name = std::env::var("FIELDSTORE_DB_NAME")
            .ok()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| DEFAULT_DB_NAME.to_string());

        let in_memory = std::env::var("FIELDSTORE_IN_MEMORY")
            .map(|v| v == "true" || v == "1" || v == "yes")
            .unwrap_or(false);

        let busy_timeout_ms = parse_number("FIELDSTORE_BUSY_TIMEOUT_MS", DEFAULT_BUSY_TIMEOUT_MS)?;
        let page_size = parse_number("FIELDSTORE_PAGE_SIZE", DEFAULT_PAGE_SIZE)?;
        if page_size == 0 {
            return Err(ConfigError::ZeroPageSize);
        }

        Ok(Self {
            home,
            db_name,
            in_memory,
            busy_timeout_ms,
            page_size,
        })
    }
}
