//! Retrieval error types.
//!
//! Every variant here aborts the current run of an adapter. The poll loop
//! logs it and retries on the next tick.

use thiserror::Error;

use crate::db::DatabaseError;
use crate::secrets::SecretError;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("IMAP connection failed: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Mailbox credentials unavailable: {0}")]
    Credentials(#[from] SecretError),

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("IMAP folder '{0}' not found")]
    FolderNotFound(String),

    #[error("Timed out after {seconds}s while {action}")]
    Timeout { action: &'static str, seconds: u64 },

    #[error("Invalid mailbox configuration: {0}")]
    Config(String),

    #[error("Failed to read '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to walk '{path}': {source}")]
    Walk {
        path: String,
        #[source]
        source: walkdir::Error,
    },

    #[error("Ledger error: {0}")]
    Database(#[from] DatabaseError),
}

impl From<async_native_tls::Error> for SourceError {
    fn from(err: async_native_tls::Error) -> Self {
        SourceError::Tls(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SourceError>;
