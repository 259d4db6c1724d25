//! Report parsing error types.
//!
//! Every variant means the document is malformed: it is recorded as failed
//! and never retried.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    /// Zero-byte payload.
    #[error("Document is empty")]
    Empty,

    /// The gzip or zip container could not be opened or decompressed.
    #[error("Failed to decompress {kind} container: {reason}")]
    Container { kind: &'static str, reason: String },

    /// A zip archive without any `.xml` member.
    #[error("Zip archive contains no XML report")]
    NoXmlMember,

    /// Decompressed output exceeded the size cap.
    #[error("Decompressed report exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Report is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("Invalid report XML: {0}")]
    Xml(String),

    /// A field the canonical structure cannot do without.
    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// Every record was dropped (or none were present).
    #[error("Report contains no valid records")]
    NoRecords,
}

impl From<quick_xml::DeError> for ParseError {
    fn from(err: quick_xml::DeError) -> Self {
        ParseError::Xml(err.to_string())
    }
}
