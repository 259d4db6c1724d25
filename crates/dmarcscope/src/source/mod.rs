//! Retrieval adapters that turn a mailbox or local files into report
//! documents for ingestion.
//!
//! Adapters keep no memory between runs. Each run re-scans its source and
//! leans on the processed-source ledger to skip work already done.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use crate::report::ContainerKind;

pub mod attachments;
pub mod client;
pub mod error;
pub mod local;
pub mod mailbox;

pub use attachments::{extract_report_attachments, ReportAttachment};
pub use client::ImapClient;
pub use error::{Result, SourceError};
pub use local::LocalSource;
pub use mailbox::{CycleStats, MailboxSource};

/// Which adapter produced a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Mailbox,
    Local,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Mailbox => "mailbox",
            SourceKind::Local => "local",
        }
    }
}

impl FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "mailbox" => Ok(SourceKind::Mailbox),
            "local" => Ok(SourceKind::Local),
            other => Err(format!("unknown source kind '{}'", other)),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One candidate report document, not yet parsed.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub bytes: Vec<u8>,
    /// Stable identifier used by the ledger (`<message-id>#<n>` or
    /// `sha256:<hex>`).
    pub source_id: String,
    pub kind: SourceKind,
    /// Message-ID or file path, kept for operators.
    pub origin: Option<String>,
    /// Container guess from the filename or MIME type.
    pub hint: Option<ContainerKind>,
}

impl SourceDocument {
    pub fn new(bytes: Vec<u8>, source_id: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            bytes,
            source_id: source_id.into(),
            kind,
            origin: None,
            hint: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_hint(mut self, hint: Option<ContainerKind>) -> Self {
        self.hint = hint;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_kind_round_trip() {
        for kind in [SourceKind::Mailbox, SourceKind::Local] {
            assert_eq!(kind.as_str().parse::<SourceKind>().unwrap(), kind);
        }
        assert!("imap".parse::<SourceKind>().is_err());
        assert_eq!(serde_json::to_string(&SourceKind::Local).unwrap(), "\"local\"");
    }
}
