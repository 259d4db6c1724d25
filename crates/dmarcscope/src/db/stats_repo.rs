//! Store-wide statistics for dashboards and the CLI.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::report_repo::from_unix;
use super::{Database, DatabaseError};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Overview {
    pub total_reports: u64,
    pub total_domains: u64,
    pub total_source_ips: u64,
    pub total_messages: u64,
    pub first_report: Option<DateTime<Utc>>,
    pub last_report: Option<DateTime<Utc>>,
    pub failed_sources: u64,
}

pub fn overview(db: &Database) -> Result<Overview, DatabaseError> {
    db.with_read_conn(|conn| {
        let (total_reports, total_domains, first, last): (u64, u64, Option<i64>, Option<i64>) =
            conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT domain), MIN(date_range_begin), MAX(date_range_end)
                 FROM reports",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?;

        let (total_source_ips, total_messages): (u64, u64) = conn.query_row(
            "SELECT COUNT(DISTINCT source_ip), COALESCE(SUM(count), 0) FROM records",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let failed_sources: u64 = conn.query_row(
            "SELECT COUNT(*) FROM processed_sources WHERE status = 'failed'",
            [],
            |row| row.get(0),
        )?;

        Ok(Overview {
            total_reports,
            total_domains,
            total_source_ips,
            total_messages,
            first_report: first.map(|s| from_unix(s, "date_range_begin")).transpose()?,
            last_report: last.map(|s| from_unix(s, "date_range_end")).transpose()?,
            failed_sources,
        })
    })
}

/// Message counts per applied disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispositionBreakdown {
    pub none: u64,
    pub quarantine: u64,
    pub reject: u64,
}

impl DispositionBreakdown {
    pub fn total(&self) -> u64 {
        self.none + self.quarantine + self.reject
    }
}

/// Breakdown across all reports, or those of one policy domain.
pub fn disposition_breakdown(
    db: &Database,
    domain: Option<&str>,
) -> Result<DispositionBreakdown, DatabaseError> {
    db.with_read_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT rec.disposition, SUM(rec.count)
             FROM records rec JOIN reports r ON r.id = rec.report_id
             WHERE ?1 IS NULL OR r.domain = ?1
             GROUP BY rec.disposition",
        )?;
        let rows = stmt
            .query_map(params![domain.map(str::to_ascii_lowercase)], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut breakdown = DispositionBreakdown::default();
        for (disposition, count) in rows {
            match disposition.as_str() {
                "none" => breakdown.none = count,
                "quarantine" => breakdown.quarantine = count,
                "reject" => breakdown.reject = count,
                other => {
                    return Err(DatabaseError::InvalidValue {
                        column: "disposition",
                        value: other.to_string(),
                    })
                }
            }
        }
        Ok(breakdown)
    })
}
