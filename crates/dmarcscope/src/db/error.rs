//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    #[error("Database lock poisoned")]
    LockPoisoned,

    /// A stored value that does not map back onto the domain model.
    #[error("Corrupt value in column '{column}': {value}")]
    InvalidValue { column: &'static str, value: String },

    #[error("Failed to encode column value: {0}")]
    Encode(#[from] serde_json::Error),
}

impl DatabaseError {
    /// True for `UNIQUE`/`PRIMARY KEY`/`FOREIGN KEY`/`CHECK` violations.
    pub fn is_constraint_violation(&self) -> bool {
        matches!(
            self,
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation
        )
    }
}
