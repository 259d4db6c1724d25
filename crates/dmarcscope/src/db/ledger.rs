//! Processed-source ledger: one row per source identifier the system has
//! handled, whatever adapter produced it.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{Database, DatabaseError};
use crate::report::ParseWarning;
use crate::source::SourceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerStatus {
    Ingested,
    Duplicate,
    Failed,
    /// A mail message whose attachments were all handled.
    Scanned,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Ingested => "ingested",
            LedgerStatus::Duplicate => "duplicate",
            LedgerStatus::Failed => "failed",
            LedgerStatus::Scanned => "scanned",
        }
    }
}

impl FromStr for LedgerStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ingested" => Ok(LedgerStatus::Ingested),
            "duplicate" => Ok(LedgerStatus::Duplicate),
            "failed" => Ok(LedgerStatus::Failed),
            "scanned" => Ok(LedgerStatus::Scanned),
            other => Err(DatabaseError::InvalidValue {
                column: "status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for LedgerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub source_id: String,
    pub source_kind: SourceKind,
    pub status: LedgerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Message-ID or file path, for operators.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parse_warnings: Vec<ParseWarning>,
    pub processed_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(source_id: impl Into<String>, source_kind: SourceKind, status: LedgerStatus) -> Self {
        Self {
            source_id: source_id.into(),
            source_kind,
            status,
            report_id: None,
            error: None,
            origin: None,
            parse_warnings: Vec::new(),
            processed_at: Utc::now(),
        }
    }

    pub fn with_report_id(mut self, report_id: impl Into<String>) -> Self {
        self.report_id = Some(report_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }

    pub fn with_warnings(mut self, warnings: Vec<ParseWarning>) -> Self {
        self.parse_warnings = warnings;
        self
    }
}

/// Inserts an entry unless the source id is already present.
/// Returns `false` when another entry won.
pub fn insert_in(conn: &Connection, entry: &LedgerEntry) -> Result<bool, DatabaseError> {
    let warnings = if entry.parse_warnings.is_empty() {
        None
    } else {
        Some(serde_json::to_string(&entry.parse_warnings)?)
    };

    let changed = conn.execute(
        "INSERT OR IGNORE INTO processed_sources
         (source_id, source_kind, status, report_id, error, origin, parse_warnings, processed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.source_id,
            entry.source_kind.as_str(),
            entry.status.as_str(),
            entry.report_id,
            entry.error,
            entry.origin,
            warnings,
            super::format_timestamp(&entry.processed_at),
        ],
    )?;
    Ok(changed > 0)
}

pub fn insert(db: &Database, entry: &LedgerEntry) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| insert_in(conn, entry))
}

/// Checked on the writer so the answer reflects the latest commit.
pub fn exists(db: &Database, source_id: &str) -> Result<bool, DatabaseError> {
    db.with_conn(|conn| {
        let found = conn
            .query_row(
                "SELECT 1 FROM processed_sources WHERE source_id = ?1",
                params![source_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    })
}

pub fn find(db: &Database, source_id: &str) -> Result<Option<LedgerEntry>, DatabaseError> {
    db.with_read_conn(|conn| {
        let raw = conn
            .query_row(
                &format!("{} WHERE source_id = ?1", SELECT_ENTRY),
                params![source_id],
                RawEntry::from_row,
            )
            .optional()?;
        raw.map(RawEntry::into_entry).transpose()
    })
}

/// Returns the subset of `ids` that carry a `scanned` marker.
pub fn scanned_among(db: &Database, ids: &[String]) -> Result<HashSet<String>, DatabaseError> {
    if ids.is_empty() {
        return Ok(HashSet::new());
    }

    db.with_conn(|conn| {
        let mut found = HashSet::new();
        // Stay well below SQLITE_MAX_VARIABLE_NUMBER.
        for chunk in ids.chunks(500) {
            let placeholders: Vec<String> = (0..chunk.len()).map(|i| format!("?{}", i + 1)).collect();
            let sql = format!(
                "SELECT source_id FROM processed_sources
                 WHERE status = 'scanned' AND source_id IN ({})",
                placeholders.join(", ")
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(chunk.iter()), |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                found.insert(row?);
            }
        }
        Ok(found)
    })
}

/// Failed entries, newest first.
pub fn list_failures(db: &Database, limit: u32) -> Result<Vec<LedgerEntry>, DatabaseError> {
    db.with_read_conn(|conn| {
        let mut stmt = conn.prepare(&format!(
            "{} WHERE status = 'failed' ORDER BY processed_at DESC, source_id LIMIT ?1",
            SELECT_ENTRY
        ))?;
        let raws = stmt
            .query_map(params![limit], RawEntry::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        raws.into_iter().map(RawEntry::into_entry).collect()
    })
}

/// Entry counts per status.
pub fn status_counts(db: &Database) -> Result<Vec<(LedgerStatus, u64)>, DatabaseError> {
    db.with_read_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM processed_sources GROUP BY status ORDER BY status",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(status, count)| Ok((status.parse()?, count)))
            .collect()
    })
}

const SELECT_ENTRY: &str = "SELECT source_id, source_kind, status, report_id, error, origin,
    parse_warnings, processed_at FROM processed_sources";

struct RawEntry {
    source_id: String,
    source_kind: String,
    status: String,
    report_id: Option<String>,
    error: Option<String>,
    origin: Option<String>,
    parse_warnings: Option<String>,
    processed_at: String,
}

impl RawEntry {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            source_id: row.get(0)?,
            source_kind: row.get(1)?,
            status: row.get(2)?,
            report_id: row.get(3)?,
            error: row.get(4)?,
            origin: row.get(5)?,
            parse_warnings: row.get(6)?,
            processed_at: row.get(7)?,
        })
    }

    fn into_entry(self) -> Result<LedgerEntry, DatabaseError> {
        let source_kind = self
            .source_kind
            .parse()
            .map_err(|_| DatabaseError::InvalidValue {
                column: "source_kind",
                value: self.source_kind.clone(),
            })?;
        let processed_at = DateTime::parse_from_rfc3339(&self.processed_at)
            .map_err(|_| DatabaseError::InvalidValue {
                column: "processed_at",
                value: self.processed_at.clone(),
            })?
            .with_timezone(&Utc);
        let parse_warnings = match self.parse_warnings.as_deref() {
            Some(json) => serde_json::from_str(json)?,
            None => Vec::new(),
        };

        Ok(LedgerEntry {
            source_id: self.source_id,
            source_kind,
            status: self.status.parse()?,
            report_id: self.report_id,
            error: self.error,
            origin: self.origin,
            parse_warnings,
            processed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn insert_is_first_writer_wins() {
        let db = Database::open_in_memory().unwrap();
        let first = LedgerEntry::new("sha256:aa", SourceKind::Local, LedgerStatus::Ingested)
            .with_report_id("r-1");
        let second = LedgerEntry::new("sha256:aa", SourceKind::Local, LedgerStatus::Failed)
            .with_error("late");

        assert!(insert(&db, &first).unwrap());
        assert!(!insert(&db, &second).unwrap());

        let stored = find(&db, "sha256:aa").unwrap().unwrap();
        assert_eq!(stored.status, LedgerStatus::Ingested);
        assert_eq!(stored.report_id.as_deref(), Some("r-1"));
        assert!(exists(&db, "sha256:aa").unwrap());
        assert!(!exists(&db, "sha256:bb").unwrap());
    }

    #[test]
    fn warnings_round_trip_as_json() {
        let db = Database::open_in_memory().unwrap();
        let warning = ParseWarning {
            field: "record[0].row.count".to_string(),
            message: "0 below minimum; clamped to 1".to_string(),
        };
        let entry = LedgerEntry::new("<m@x>#1", SourceKind::Mailbox, LedgerStatus::Ingested)
            .with_origin(Some("<m@x>".to_string()))
            .with_warnings(vec![warning.clone()]);
        insert(&db, &entry).unwrap();

        let stored = find(&db, "<m@x>#1").unwrap().unwrap();
        assert_eq!(stored.parse_warnings, vec![warning]);
        assert_eq!(stored.source_kind, SourceKind::Mailbox);
        assert_eq!(stored.origin.as_deref(), Some("<m@x>"));
    }

    #[test]
    fn failures_are_listed_newest_first() {
        let db = Database::open_in_memory().unwrap();
        let now = Utc::now();
        for (id, status, age_minutes) in [
            ("a", LedgerStatus::Failed, 30),
            ("b", LedgerStatus::Ingested, 20),
            ("c", LedgerStatus::Failed, 10),
        ] {
            let mut entry = LedgerEntry::new(id, SourceKind::Local, status);
            entry.processed_at = now - Duration::minutes(age_minutes);
            insert(&db, &entry).unwrap();
        }

        let failures = list_failures(&db, 10).unwrap();
        let ids: Vec<&str> = failures.iter().map(|e| e.source_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
        assert_eq!(list_failures(&db, 1).unwrap().len(), 1);
    }

    #[test]
    fn scanned_markers_are_found() {
        let db = Database::open_in_memory().unwrap();
        insert(
            &db,
            &LedgerEntry::new("<one@x>", SourceKind::Mailbox, LedgerStatus::Scanned),
        )
        .unwrap();
        insert(
            &db,
            &LedgerEntry::new("<two@x>", SourceKind::Mailbox, LedgerStatus::Failed),
        )
        .unwrap();

        let ids = vec!["<one@x>".to_string(), "<two@x>".to_string(), "<three@x>".to_string()];
        let scanned = scanned_among(&db, &ids).unwrap();
        assert_eq!(scanned.len(), 1);
        assert!(scanned.contains("<one@x>"));
        assert!(scanned_among(&db, &[]).unwrap().is_empty());
    }

    #[test]
    fn counts_by_status() {
        let db = Database::open_in_memory().unwrap();
        for (id, status) in [
            ("a", LedgerStatus::Ingested),
            ("b", LedgerStatus::Ingested),
            ("c", LedgerStatus::Duplicate),
        ] {
            insert(&db, &LedgerEntry::new(id, SourceKind::Local, status)).unwrap();
        }
        let counts = status_counts(&db).unwrap();
        assert_eq!(
            counts,
            vec![(LedgerStatus::Duplicate, 1), (LedgerStatus::Ingested, 2)]
        );
    }
}
