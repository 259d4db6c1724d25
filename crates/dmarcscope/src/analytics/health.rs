//! Per-source authentication health.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::percent;
use crate::db::report_repo::from_unix;
use crate::db::{Database, DatabaseError};
use crate::report::canonical_ip;

/// Ordered from best to worst, so `max` picks the more severe status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Poor,
}

impl HealthStatus {
    /// Above 80% is healthy, 50% to 80% inclusive is a warning, below 50% is
    /// poor. Compared in integers so the boundaries are exact.
    pub fn classify(pass: u64, evaluated: u64) -> Option<Self> {
        if evaluated == 0 {
            return None;
        }
        let scaled = u128::from(pass) * 100;
        let evaluated = u128::from(evaluated);
        Some(if scaled > evaluated * 80 {
            HealthStatus::Healthy
        } else if scaled >= evaluated * 50 {
            HealthStatus::Warning
        } else {
            HealthStatus::Poor
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MechanismHealth {
    pub pass: u64,
    pub evaluated: u64,
    pub rate: f64,
    pub status: HealthStatus,
}

impl MechanismHealth {
    fn from_counts(pass: u64, evaluated: u64) -> Option<Self> {
        HealthStatus::classify(pass, evaluated).map(|status| Self {
            pass,
            evaluated,
            rate: percent(pass, evaluated),
            status,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceHealth {
    pub source_ip: String,
    pub total_messages: u64,
    pub report_count: u64,
    pub domains: Vec<String>,
    pub last_seen: Option<DateTime<Utc>>,
    pub dkim: Option<MechanismHealth>,
    pub spf: Option<MechanismHealth>,
    /// The worse of the two mechanisms; poor when neither was evaluated.
    pub status: HealthStatus,
}

const STATS_COLUMNS: &str = "source_ip, total, dkim_pass, dkim_evaluated, spf_pass, \
                             spf_evaluated, report_count, last_seen";

/// Health of one sending IP across every stored report. `None` if the IP
/// never appeared. Any spelling of the address matches.
pub fn source_health(db: &Database, source_ip: &str) -> Result<Option<SourceHealth>, DatabaseError> {
    let source_ip = canonical_ip(source_ip);
    db.with_read_conn(|conn| {
        let sql = format!("SELECT {} FROM source_ip_stats WHERE source_ip = ?1", STATS_COLUMNS);
        let stats = conn
            .query_row(&sql, params![source_ip], read_stats)
            .optional()?;
        stats.map(|s| build(conn, s)).transpose()
    })
}

/// Every source, highest volume first.
pub fn source_health_list(db: &Database, limit: u32) -> Result<Vec<SourceHealth>, DatabaseError> {
    db.with_read_conn(|conn| source_health_list_in(conn, limit))
}

pub(crate) fn source_health_list_in(
    conn: &Connection,
    limit: u32,
) -> Result<Vec<SourceHealth>, DatabaseError> {
    let sql = format!(
        "SELECT {} FROM source_ip_stats ORDER BY total DESC, source_ip ASC LIMIT ?1",
        STATS_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![limit], read_stats)?
        .collect::<Result<Vec<_>, _>>()?;
    rows.into_iter().map(|s| build(conn, s)).collect()
}

struct SourceStats {
    source_ip: String,
    total: u64,
    dkim_pass: u64,
    dkim_evaluated: u64,
    spf_pass: u64,
    spf_evaluated: u64,
    report_count: u64,
    last_seen: Option<i64>,
}

fn read_stats(row: &Row<'_>) -> rusqlite::Result<SourceStats> {
    Ok(SourceStats {
        source_ip: row.get(0)?,
        total: row.get(1)?,
        dkim_pass: row.get(2)?,
        dkim_evaluated: row.get(3)?,
        spf_pass: row.get(4)?,
        spf_evaluated: row.get(5)?,
        report_count: row.get(6)?,
        last_seen: row.get(7)?,
    })
}

fn build(conn: &Connection, stats: SourceStats) -> Result<SourceHealth, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "SELECT DISTINCT r.domain FROM records rec JOIN reports r ON r.id = rec.report_id
         WHERE rec.source_ip = ?1 ORDER BY r.domain",
    )?;
    let domains = stmt
        .query_map(params![stats.source_ip], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;

    let dkim = MechanismHealth::from_counts(stats.dkim_pass, stats.dkim_evaluated);
    let spf = MechanismHealth::from_counts(stats.spf_pass, stats.spf_evaluated);
    let status = [&dkim, &spf]
        .into_iter()
        .flatten()
        .map(|m| m.status)
        .max()
        .unwrap_or(HealthStatus::Poor);

    Ok(SourceHealth {
        source_ip: stats.source_ip,
        total_messages: stats.total,
        report_count: stats.report_count,
        domains,
        last_seen: stats
            .last_seen
            .map(|s| from_unix(s, "date_range_end"))
            .transpose()?,
        dkim,
        spf,
        status,
    })
}
