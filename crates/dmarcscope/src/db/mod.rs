//! Database module for persistent storage.
//!
//! Uses rusqlite (SQLite) with a thread-safe `Database` handle holding a
//! writer connection and a reader connection. Ingestion goes through the
//! writer; analytics read through the reader, so in WAL mode they see only
//! committed data and are never blocked by an open ingest transaction.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::info;

pub mod error;
pub mod ledger;
pub mod migrations;
pub mod report_repo;
pub mod stats_repo;

pub use error::DatabaseError;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseLocation {
    File(PathBuf),
    Memory,
}

impl DatabaseLocation {
    /// Accepts a plain path, `sqlite:path`, `sqlite://path` or `:memory:`.
    /// A leading `~` is expanded.
    pub fn parse(url: &str) -> Self {
        let path = url
            .strip_prefix("sqlite://")
            .or_else(|| url.strip_prefix("sqlite:"))
            .unwrap_or(url);
        let path = path.split('?').next().unwrap_or(path);
        if path == ":memory:" || path.is_empty() {
            return DatabaseLocation::Memory;
        }
        DatabaseLocation::File(PathBuf::from(crate::secrets::expand_home(path)))
    }
}

/// Thread-safe database handle.
///
/// Cloning is cheap (inner `Arc`s). In-memory databases cannot be shared
/// between connections, so there the reader is the writer.
#[derive(Clone)]
pub struct Database {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open_location(location: &DatabaseLocation) -> Result<Self, DatabaseError> {
        match location {
            DatabaseLocation::File(path) => Self::open(path),
            DatabaseLocation::Memory => Self::open_in_memory(),
        }
    }

    /// Opens (or creates) the database at the given path and runs all
    /// pending migrations.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let writer = Connection::open(path)?;
        configure(&writer)?;
        writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        migrations::run_all(&writer)?;

        let reader = Connection::open(path)?;
        configure(&reader)?;

        info!(path = %path.display(), "Database opened");

        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
        })
    }

    /// Opens an in-memory database for testing. Runs all migrations.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        configure(&conn)?;
        migrations::run_all(&conn)?;

        let conn = Arc::new(Mutex::new(conn));
        Ok(Self {
            writer: Arc::clone(&conn),
            reader: conn,
        })
    }

    /// Provides locked access to the writer connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.writer.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Provides locked access to the reader connection.
    pub fn with_read_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.reader.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }

    /// Runs `f` inside an immediate transaction on the writer.
    ///
    /// The transaction commits only if `f` returns `Ok` and asks for it via
    /// [`TxOutcome::Commit`]; any error or [`TxOutcome::Rollback`] rolls back.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Transaction<'_>) -> Result<TxOutcome<T>, DatabaseError>,
    {
        let mut conn = self.writer.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        match f(&tx)? {
            TxOutcome::Commit(value) => {
                tx.commit()?;
                Ok(value)
            }
            TxOutcome::Rollback(value) => {
                tx.rollback()?;
                Ok(value)
            }
        }
    }
}

/// Decision returned from a [`Database::with_tx`] closure.
#[derive(Debug)]
pub enum TxOutcome<T> {
    Commit(T),
    Rollback(T),
}

fn configure(conn: &Connection) -> Result<(), DatabaseError> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

/// Canonical text form for stored timestamps (fixed width, UTC, sortable).
pub(crate) fn format_timestamp(at: &chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Returns the canonical database path: `~/.dmarcscope/data/dmarcscope.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".dmarcscope").join("data").join("dmarcscope.db"))
}
