//! SQLite connection pool shared by every inbox component.
//!
//! Components receive a [`Database`] in their constructor instead of opening
//! connections themselves, so tests can point the whole stack at a temp file.

mod schema;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::ErrorCode;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::error;

pub use schema::INBOX_SCHEMA;

pub type DbConnection = PooledConnection<SqliteConnectionManager>;

/// Logs pool checkout failures before r2d2 retries them.
#[derive(Debug)]
struct LoggingErrorHandler;

impl r2d2::HandleError<rusqlite::Error> for LoggingErrorHandler {
    fn handle_error(&self, err: rusqlite::Error) {
        error!("sqlite connection pool error: {:?}", err);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

impl StoreError {
    /// True when the failure is a transient lock or pool checkout timeout.
    pub fn is_contention(&self) -> bool {
        match self {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ),
            StoreError::Pool(_) => true,
            _ => false,
        }
    }

    pub(crate) fn invalid(column: &'static str, value: impl Into<String>) -> Self {
        StoreError::InvalidValue {
            column,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DatabaseOptions {
    pub max_connections: u32,
    pub busy_timeout: Duration,
    pub connection_timeout: Duration,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 8,
            busy_timeout: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path)
            .field("state", &self.pool.state())
            .finish()
    }
}

impl Database {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with(path, DatabaseOptions::default())
    }

    pub fn open_with(path: impl Into<PathBuf>, options: DatabaseOptions) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let busy_timeout = options.busy_timeout;
        let manager = SqliteConnectionManager::file(&path).with_init(move |conn| {
            conn.busy_timeout(busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "foreign_keys", "ON")?;
            Ok(())
        });
        let pool = Pool::builder()
            .max_size(options.max_connections.max(1))
            .connection_timeout(options.connection_timeout)
            .error_handler(Box::new(LoggingErrorHandler))
            .build(manager)?;
        let db = Self { pool, path };
        db.connection()?.execute_batch(INBOX_SCHEMA)?;
        Ok(db)
    }

    pub fn connection(&self) -> Result<DbConnection, StoreError> {
        Ok(self.pool.get()?)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    let parsed = DateTime::parse_from_rfc3339(value)?;
    Ok(parsed.with_timezone(&Utc))
}

pub fn parse_optional_datetime(value: Option<String>) -> Result<Option<DateTime<Utc>>, StoreError> {
    value.as_deref().map(parse_datetime).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn open_creates_schema_and_parent_dirs() {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("nested").join("inbox.db")).expect("open");
        let conn = db.connection().expect("conn");
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name IN ('jobs', 'raw_events', 'conversations', 'messages', 'shadow_states')",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 5);
    }

    #[test]
    fn datetime_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::milliseconds(1500);
        let a = format_datetime(early);
        let b = format_datetime(late);
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert_eq!(parse_datetime(&a).unwrap(), early);
    }

    #[test]
    fn busy_errors_count_as_contention() {
        let busy = StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ));
        assert!(busy.is_contention());
        assert!(!StoreError::invalid("status", "bogus").is_contention());
    }
}
