//! Per policy-domain aggregates.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::percent;
use crate::db::report_repo::{from_unix, parse_action};
use crate::db::{Database, DatabaseError};
use crate::report::PolicyAction;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainAggregate {
    pub domain: String,
    pub report_count: u64,
    pub total: u64,
    pub passed: u64,
    pub quarantined: u64,
    pub rejected: u64,
    pub dkim_pass: u64,
    pub spf_pass: u64,
    pub first_begin: DateTime<Utc>,
    pub last_end: DateTime<Utc>,
    /// `p` of the report with the latest period end.
    pub latest_policy: PolicyAction,
    /// Quarantined plus rejected, as a percentage of the total.
    pub failure_rate: f64,
}

impl DomainAggregate {
    pub fn failed(&self) -> u64 {
        self.quarantined + self.rejected
    }
}

// The latest policy is taken from the report with the greatest end time,
// highest row id on ties.
const AGGREGATE_SQL: &str = "
    SELECT s.domain, s.report_count, s.total, s.passed, s.quarantined, s.rejected,
           s.dkim_pass, s.spf_pass, s.first_begin, s.last_end,
           (SELECT r.p FROM reports r WHERE r.domain = s.domain
            ORDER BY r.date_range_end DESC, r.id DESC LIMIT 1) AS latest_p
    FROM domain_stats s";

/// All domains, highest volume first.
pub fn domain_aggregates(db: &Database) -> Result<Vec<DomainAggregate>, DatabaseError> {
    db.with_read_conn(domain_aggregates_in)
}

pub(crate) fn domain_aggregates_in(conn: &Connection) -> Result<Vec<DomainAggregate>, DatabaseError> {
    let sql = format!("{} ORDER BY s.total DESC, s.domain ASC", AGGREGATE_SQL);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], read_row)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(RawAggregate::into_aggregate).collect()
}

/// Aggregate for one domain (case-insensitive). `None` if no report names it.
pub fn domain_aggregate(db: &Database, domain: &str) -> Result<Option<DomainAggregate>, DatabaseError> {
    let domain = domain.trim().to_ascii_lowercase();
    db.with_read_conn(|conn| {
        let sql = format!("{} WHERE s.domain = ?1", AGGREGATE_SQL);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt
            .query_map(params![domain], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.pop().map(RawAggregate::into_aggregate).transpose()
    })
}

struct RawAggregate {
    domain: String,
    report_count: u64,
    total: u64,
    passed: u64,
    quarantined: u64,
    rejected: u64,
    dkim_pass: u64,
    spf_pass: u64,
    first_begin: i64,
    last_end: i64,
    latest_p: String,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawAggregate> {
    Ok(RawAggregate {
        domain: row.get(0)?,
        report_count: row.get(1)?,
        total: row.get(2)?,
        passed: row.get(3)?,
        quarantined: row.get(4)?,
        rejected: row.get(5)?,
        dkim_pass: row.get(6)?,
        spf_pass: row.get(7)?,
        first_begin: row.get(8)?,
        last_end: row.get(9)?,
        latest_p: row.get(10)?,
    })
}

impl RawAggregate {
    fn into_aggregate(self) -> Result<DomainAggregate, DatabaseError> {
        Ok(DomainAggregate {
            failure_rate: percent(self.quarantined + self.rejected, self.total),
            latest_policy: parse_action(&self.latest_p, "p")?,
            first_begin: from_unix(self.first_begin, "date_range_begin")?,
            last_end: from_unix(self.last_end, "date_range_end")?,
            domain: self.domain,
            report_count: self.report_count,
            total: self.total,
            passed: self.passed,
            quarantined: self.quarantined,
            rejected: self.rejected,
            dkim_pass: self.dkim_pass,
            spf_pass: self.spf_pass,
        })
    }
}
