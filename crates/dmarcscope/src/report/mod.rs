//! Canonical DMARC aggregate report structure.
//!
//! Everything downstream of the parser (persistence, analytics) works with
//! these types. Raw XML shapes live in [`parser`] and never leak out of it.

pub mod container;
pub mod error;
pub mod parser;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use container::{decode_container, ContainerKind};
pub use error::ParseError;
pub use parser::{parse_document, parse_xml, ParseWarning, ParsedReport};

/// Policy action, used both for the published policy (`p`, `sp`) and for the
/// disposition applied to a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    #[default]
    None,
    Quarantine,
    Reject,
}

impl PolicyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PolicyAction::None => "none",
            PolicyAction::Quarantine => "quarantine",
            PolicyAction::Reject => "reject",
        }
    }
}

impl FromStr for PolicyAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PolicyAction::None),
            "quarantine" => Ok(PolicyAction::Quarantine),
            "reject" => Ok(PolicyAction::Reject),
            other => Err(format!("unknown policy action '{}'", other)),
        }
    }
}

impl fmt::Display for PolicyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier alignment mode (`adkim` / `aspf`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    #[default]
    Relaxed,
    Strict,
}

impl Alignment {
    /// Single-letter form used in the report XML and in the store.
    pub fn as_str(&self) -> &'static str {
        match self {
            Alignment::Relaxed => "r",
            Alignment::Strict => "s",
        }
    }
}

impl FromStr for Alignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "r" | "relaxed" => Ok(Alignment::Relaxed),
            "s" | "strict" => Ok(Alignment::Strict),
            other => Err(format!("unknown alignment mode '{}'", other)),
        }
    }
}

/// Result code of a single authentication check.
///
/// Values outside RFC 7489 are kept verbatim (lower-cased) in `Other`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthResult {
    None,
    Pass,
    Fail,
    SoftFail,
    Neutral,
    TempError,
    PermError,
    Policy,
    Other(String),
}

impl AuthResult {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "none" => AuthResult::None,
            "pass" => AuthResult::Pass,
            "fail" => AuthResult::Fail,
            "softfail" => AuthResult::SoftFail,
            "neutral" => AuthResult::Neutral,
            "temperror" => AuthResult::TempError,
            "permerror" => AuthResult::PermError,
            "policy" => AuthResult::Policy,
            other => AuthResult::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AuthResult::None => "none",
            AuthResult::Pass => "pass",
            AuthResult::Fail => "fail",
            AuthResult::SoftFail => "softfail",
            AuthResult::Neutral => "neutral",
            AuthResult::TempError => "temperror",
            AuthResult::PermError => "permerror",
            AuthResult::Policy => "policy",
            AuthResult::Other(s) => s,
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, AuthResult::Pass)
    }
}

impl fmt::Display for AuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for AuthResult {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The policy the domain owner published in DNS, as seen by the reporter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedPolicy {
    pub domain: String,
    pub adkim: Alignment,
    pub aspf: Alignment,
    pub p: PolicyAction,
    pub sp: PolicyAction,
    pub pct: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DkimResult {
    pub domain: String,
    pub selector: Option<String>,
    pub result: AuthResult,
    pub human_result: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpfResult {
    pub domain: String,
    pub scope: String,
    pub result: AuthResult,
}

/// Canonical text of a source address (lowercase, compressed IPv6), so one
/// sender is one key however the reporter spelled it. Anything that is not an
/// IP address is returned trimmed but otherwise verbatim.
pub fn canonical_ip(raw: &str) -> String {
    let raw = raw.trim();
    match raw.parse::<IpAddr>() {
        Ok(ip) => ip.to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Traffic from one source address within a report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub source_ip: String,
    pub count: u32,
    pub disposition: PolicyAction,
    /// Policy-evaluated DKIM outcome (`None` when the reporter left it out).
    pub dkim: Option<AuthResult>,
    /// Policy-evaluated SPF outcome.
    pub spf: Option<AuthResult>,
    pub header_from: Option<String>,
    pub envelope_from: Option<String>,
    pub envelope_to: Option<String>,
    pub dkim_results: Vec<DkimResult>,
    pub spf_results: Vec<SpfResult>,
}

/// One aggregate report, fully validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub org_name: Option<String>,
    pub email: Option<String>,
    pub extra_contact_info: Option<String>,
    pub report_id: String,
    pub date_range_begin: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub policy: PublishedPolicy,
    pub records: Vec<Record>,
    #[serde(skip)]
    pub raw_xml: String,
}

impl Report {
    /// Total messages covered by the report.
    pub fn message_count(&self) -> u64 {
        self.records.iter().map(|r| u64::from(r.count)).sum()
    }
}
