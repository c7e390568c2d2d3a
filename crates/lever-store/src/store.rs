use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use lever_core::{LeverError, Result};

use crate::schema;

/// Versioned policy state plus the audit trail, behind one SQLite connection.
/// Cloning shares the connection.
#[derive(Clone)]
pub struct PolicyStore {
    pub(crate) db: Arc<Mutex<Connection>>,
}

impl PolicyStore {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        info!(?path, "opening policy store");

        let conn = Connection::open(path).map_err(db_err)?;

        // WAL for concurrent readers
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .map_err(db_err)?;

        schema::create(&conn).map_err(db_err)?;

        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory() -> Result<Self> {
        Self::open(Path::new(":memory:"))
    }

    /// Raw connection access for ad-hoc queries.
    pub fn db(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.db.lock()
    }

    /// Number of rows in one of the store's tables.
    pub fn count_rows(&self, table: &str) -> Result<u64> {
        let known = schema::VERSIONED_TABLES
            .iter()
            .chain(schema::APPEND_ONLY_TABLES)
            .chain(&["policy_heads", "policy_override_authority", "budget_counters"])
            .any(|t| *t == table);
        if !known {
            return Err(LeverError::Store(format!("unknown table '{table}'")));
        }
        let db = self.db.lock();
        let n: i64 = db
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as u64)
    }
}

pub(crate) fn db_err(e: rusqlite::Error) -> LeverError {
    LeverError::Store(e.to_string())
}

/// Fixed-width UTC timestamps so text ordering matches time ordering.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn checksum(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}

pub(crate) fn conversion_err(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    let msg: String = msg.into();
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into())
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e.to_string()))
}

pub(crate) fn parse_text<T: FromStr<Err = String>>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    raw.parse().map_err(|e: String| conversion_err(idx, e))
}

pub(crate) fn parse_json<T: DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw).map_err(|e| conversion_err(idx, e.to_string()))
}

pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}
