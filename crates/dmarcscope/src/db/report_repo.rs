//! Report repository: writes a canonical report with all its records and
//! auth results, and serves the browsing queries.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::{Database, DatabaseError};
use crate::report::{
    Alignment, AuthResult, DkimResult, PolicyAction, PublishedPolicy, Record, Report, SpfResult,
};

/// Inserts the report unless its sender-assigned id is already stored.
///
/// Returns the new row id, or `None` for a duplicate. Must run inside the
/// caller's transaction so a failure leaves no partial rows.
pub fn insert_in(
    conn: &Connection,
    report: &Report,
    created_at: DateTime<Utc>,
) -> Result<Option<i64>, DatabaseError> {
    let policy = &report.policy;
    let changed = conn.execute(
        "INSERT INTO reports (org_name, email, extra_contact_info, report_id,
            date_range_begin, date_range_end, domain, adkim, aspf, p, sp, pct, raw_xml, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(report_id) DO NOTHING",
        params![
            report.org_name,
            report.email,
            report.extra_contact_info,
            report.report_id,
            report.date_range_begin.timestamp(),
            report.date_range_end.timestamp(),
            policy.domain,
            policy.adkim.as_str(),
            policy.aspf.as_str(),
            policy.p.as_str(),
            policy.sp.as_str(),
            policy.pct,
            report.raw_xml,
            super::format_timestamp(&created_at),
        ],
    )?;
    if changed == 0 {
        return Ok(None);
    }
    let report_row = conn.last_insert_rowid();

    let mut record_stmt = conn.prepare_cached(
        "INSERT INTO records (report_id, source_ip, count, disposition, dkim_result, spf_result,
            header_from, envelope_from, envelope_to)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
    )?;
    let mut dkim_stmt = conn.prepare_cached(
        "INSERT INTO dkim_auth (record_id, domain, selector, result, human_result)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut spf_stmt = conn.prepare_cached(
        "INSERT INTO spf_auth (record_id, domain, scope, result) VALUES (?1, ?2, ?3, ?4)",
    )?;

    for record in &report.records {
        record_stmt.execute(params![
            report_row,
            record.source_ip,
            record.count,
            record.disposition.as_str(),
            record.dkim.as_ref().map(AuthResult::as_str),
            record.spf.as_ref().map(AuthResult::as_str),
            record.header_from,
            record.envelope_from,
            record.envelope_to,
        ])?;
        let record_row = conn.last_insert_rowid();

        for dkim in &record.dkim_results {
            dkim_stmt.execute(params![
                record_row,
                dkim.domain,
                dkim.selector,
                dkim.result.as_str(),
                dkim.human_result,
            ])?;
        }
        for spf in &record.spf_results {
            spf_stmt.execute(params![record_row, spf.domain, spf.scope, spf.result.as_str()])?;
        }
    }

    Ok(Some(report_row))
}

pub fn exists(db: &Database, report_id: &str) -> Result<bool, DatabaseError> {
    db.with_read_conn(|conn| {
        let found = conn
            .query_row(
                "SELECT 1 FROM reports WHERE report_id = ?1",
                params![report_id],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    })
}

pub fn count(db: &Database) -> Result<u64, DatabaseError> {
    db.with_read_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM reports", [], |r| r.get(0))?))
}

/// Deletes reports whose period ended before `before`. Records and auth
/// results go with them; ledger entries stay.
pub fn delete_before(db: &Database, before: DateTime<Utc>) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let deleted = conn.execute(
            "DELETE FROM reports WHERE date_range_end < ?1",
            params![before.timestamp()],
        )?;
        Ok(deleted as u64)
    })
}

/// Filters for [`list`]. Empty filter lists everything, newest first.
#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    /// Substring match on org name, domain or report id.
    pub search: Option<String>,
    pub domain: Option<String>,
    pub org_name: Option<String>,
    /// Period ends at or after this instant.
    pub from: Option<DateTime<Utc>>,
    /// Period begins before this instant.
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub report_id: String,
    pub org_name: Option<String>,
    pub email: Option<String>,
    pub domain: String,
    pub date_range_begin: DateTime<Utc>,
    pub date_range_end: DateTime<Utc>,
    pub policy: PolicyAction,
    pub record_count: u64,
    pub message_count: u64,
    pub created_at: String,
}

pub fn list(db: &Database, filter: &ReportFilter) -> Result<Vec<ReportSummary>, DatabaseError> {
    db.with_read_conn(|conn| {
        let mut conditions = Vec::new();
        let mut param_values: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
            let n = param_values.len() + 1;
            conditions.push(format!(
                "(r.org_name LIKE ?{n} OR r.domain LIKE ?{n} OR r.report_id LIKE ?{n})"
            ));
            param_values.push(Box::new(format!("%{}%", search)));
        }
        if let Some(domain) = &filter.domain {
            conditions.push(format!("r.domain = ?{}", param_values.len() + 1));
            param_values.push(Box::new(domain.to_ascii_lowercase()));
        }
        if let Some(org) = &filter.org_name {
            conditions.push(format!("r.org_name = ?{}", param_values.len() + 1));
            param_values.push(Box::new(org.clone()));
        }
        if let Some(from) = filter.from {
            conditions.push(format!("r.date_range_end >= ?{}", param_values.len() + 1));
            param_values.push(Box::new(from.timestamp()));
        }
        if let Some(to) = filter.to {
            conditions.push(format!("r.date_range_begin < ?{}", param_values.len() + 1));
            param_values.push(Box::new(to.timestamp()));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        let limit_index = param_values.len() + 1;
        param_values.push(Box::new(i64::from(filter.limit.unwrap_or(100))));
        param_values.push(Box::new(i64::from(filter.offset.unwrap_or(0))));

        let sql = format!(
            "SELECT r.report_id, r.org_name, r.email, r.domain, r.date_range_begin,
                    r.date_range_end, r.p, COUNT(rec.id), COALESCE(SUM(rec.count), 0), r.created_at
             FROM reports r
             LEFT JOIN records rec ON rec.report_id = r.id
             {}
             GROUP BY r.id
             ORDER BY r.date_range_end DESC, r.id DESC
             LIMIT ?{} OFFSET ?{}",
            where_clause,
            limit_index,
            limit_index + 1
        );

        let params_ref: Vec<&dyn rusqlite::types::ToSql> =
            param_values.iter().map(|p| p.as_ref()).collect();
        let mut stmt = conn.prepare(&sql)?;
        let raws = stmt
            .query_map(params_ref.as_slice(), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, u64>(7)?,
                    row.get::<_, u64>(8)?,
                    row.get::<_, String>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        raws.into_iter()
            .map(
                |(report_id, org_name, email, domain, begin, end, p, records, messages, created)| {
                    Ok(ReportSummary {
                        report_id,
                        org_name,
                        email,
                        domain,
                        date_range_begin: from_unix(begin, "date_range_begin")?,
                        date_range_end: from_unix(end, "date_range_end")?,
                        policy: parse_action(&p, "p")?,
                        record_count: records,
                        message_count: messages,
                        created_at: created,
                    })
                },
            )
            .collect()
    })
}

/// A stored report rebuilt with every record and auth result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDetail {
    pub report: Report,
    pub message_count: u64,
    pub created_at: String,
}

pub fn detail(db: &Database, report_id: &str) -> Result<Option<ReportDetail>, DatabaseError> {
    db.with_read_conn(|conn| {
        let header = conn
            .query_row(
                "SELECT id, org_name, email, extra_contact_info, date_range_begin, date_range_end,
                        domain, adkim, aspf, p, sp, pct, raw_xml, created_at
                 FROM reports WHERE report_id = ?1",
                params![report_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, String>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, u8>(11)?,
                        row.get::<_, String>(12)?,
                        row.get::<_, String>(13)?,
                    ))
                },
            )
            .optional()?;

        let Some((
            row_id,
            org_name,
            email,
            extra_contact_info,
            begin,
            end,
            domain,
            adkim,
            aspf,
            p,
            sp,
            pct,
            raw_xml,
            created_at,
        )) = header
        else {
            return Ok(None);
        };

        let records = load_records(conn, row_id)?;
        let report = Report {
            org_name,
            email,
            extra_contact_info,
            report_id: report_id.to_string(),
            date_range_begin: from_unix(begin, "date_range_begin")?,
            date_range_end: from_unix(end, "date_range_end")?,
            policy: PublishedPolicy {
                domain,
                adkim: parse_alignment(&adkim, "adkim")?,
                aspf: parse_alignment(&aspf, "aspf")?,
                p: parse_action(&p, "p")?,
                sp: parse_action(&sp, "sp")?,
                pct,
            },
            records,
            raw_xml,
        };

        Ok(Some(ReportDetail {
            message_count: report.message_count(),
            report,
            created_at,
        }))
    })
}

fn load_records(conn: &Connection, report_row: i64) -> Result<Vec<Record>, DatabaseError> {
    let mut dkim_by_record: HashMap<i64, Vec<DkimResult>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT d.record_id, d.domain, d.selector, d.result, d.human_result
             FROM dkim_auth d JOIN records rec ON rec.id = d.record_id
             WHERE rec.report_id = ?1 ORDER BY d.id",
        )?;
        let rows = stmt.query_map(params![report_row], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                DkimResult {
                    domain: row.get(1)?,
                    selector: row.get(2)?,
                    result: AuthResult::parse(&row.get::<_, String>(3)?),
                    human_result: row.get(4)?,
                },
            ))
        })?;
        for row in rows {
            let (record_id, dkim) = row?;
            dkim_by_record.entry(record_id).or_default().push(dkim);
        }
    }

    let mut spf_by_record: HashMap<i64, Vec<SpfResult>> = HashMap::new();
    {
        let mut stmt = conn.prepare(
            "SELECT s.record_id, s.domain, s.scope, s.result
             FROM spf_auth s JOIN records rec ON rec.id = s.record_id
             WHERE rec.report_id = ?1 ORDER BY s.id",
        )?;
        let rows = stmt.query_map(params![report_row], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                SpfResult {
                    domain: row.get(1)?,
                    scope: row.get(2)?,
                    result: AuthResult::parse(&row.get::<_, String>(3)?),
                },
            ))
        })?;
        for row in rows {
            let (record_id, spf) = row?;
            spf_by_record.entry(record_id).or_default().push(spf);
        }
    }

    let mut stmt = conn.prepare(
        "SELECT id, source_ip, count, disposition, dkim_result, spf_result,
                header_from, envelope_from, envelope_to
         FROM records WHERE report_id = ?1 ORDER BY id",
    )?;
    let raws = stmt
        .query_map(params![report_row], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    raws.into_iter()
        .map(
            |(id, source_ip, count, disposition, dkim, spf, header_from, envelope_from, envelope_to)| {
                Ok(Record {
                    source_ip,
                    count,
                    disposition: parse_action(&disposition, "disposition")?,
                    dkim: dkim.as_deref().map(AuthResult::parse),
                    spf: spf.as_deref().map(AuthResult::parse),
                    header_from,
                    envelope_from,
                    envelope_to,
                    dkim_results: dkim_by_record.remove(&id).unwrap_or_default(),
                    spf_results: spf_by_record.remove(&id).unwrap_or_default(),
                })
            },
        )
        .collect()
}

pub(crate) fn from_unix(secs: i64, column: &'static str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp(secs, 0).ok_or(DatabaseError::InvalidValue {
        column,
        value: secs.to_string(),
    })
}

pub(crate) fn parse_action(value: &str, column: &'static str) -> Result<PolicyAction, DatabaseError> {
    value.parse().map_err(|_| DatabaseError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

fn parse_alignment(value: &str, column: &'static str) -> Result<Alignment, DatabaseError> {
    value.parse().map_err(|_| DatabaseError::InvalidValue {
        column,
        value: value.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::TxOutcome;
    use chrono::TimeZone;

    pub(crate) fn sample_report(report_id: &str, domain: &str, end_day: u32) -> Report {
        let end = Utc.with_ymd_and_hms(2026, 3, end_day, 0, 0, 0).unwrap();
        Report {
            org_name: Some("google.com".to_string()),
            email: Some("noreply-dmarc-support@google.com".to_string()),
            extra_contact_info: None,
            report_id: report_id.to_string(),
            date_range_begin: end - chrono::Duration::days(1),
            date_range_end: end,
            policy: PublishedPolicy {
                domain: domain.to_string(),
                adkim: Alignment::Relaxed,
                aspf: Alignment::Strict,
                p: PolicyAction::Quarantine,
                sp: PolicyAction::Reject,
                pct: 100,
            },
            records: vec![
                Record {
                    source_ip: "192.0.2.10".to_string(),
                    count: 7,
                    disposition: PolicyAction::None,
                    dkim: Some(AuthResult::Pass),
                    spf: Some(AuthResult::Pass),
                    header_from: Some(domain.to_string()),
                    envelope_from: Some(domain.to_string()),
                    envelope_to: None,
                    dkim_results: vec![DkimResult {
                        domain: domain.to_string(),
                        selector: Some("s1".to_string()),
                        result: AuthResult::Pass,
                        human_result: None,
                    }],
                    spf_results: vec![SpfResult {
                        domain: domain.to_string(),
                        scope: "mfrom".to_string(),
                        result: AuthResult::Pass,
                    }],
                },
                Record {
                    source_ip: "198.51.100.4".to_string(),
                    count: 3,
                    disposition: PolicyAction::Quarantine,
                    dkim: Some(AuthResult::Fail),
                    spf: None,
                    header_from: Some(domain.to_string()),
                    envelope_from: Some("bounce.other.net".to_string()),
                    envelope_to: Some("example.net".to_string()),
                    dkim_results: Vec::new(),
                    spf_results: vec![SpfResult {
                        domain: "bounce.other.net".to_string(),
                        scope: "helo".to_string(),
                        result: AuthResult::SoftFail,
                    }],
                },
            ],
            raw_xml: format!("<feedback><report_id>{}</report_id></feedback>", report_id),
        }
    }

    pub(crate) fn store(db: &Database, report: &Report) -> Option<i64> {
        db.with_tx(|tx| Ok(TxOutcome::Commit(insert_in(tx, report, Utc::now())?)))
            .unwrap()
    }

    #[test]
    fn insert_and_detail_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let report = sample_report("r-1", "example.com", 10);
        assert!(store(&db, &report).is_some());

        let stored = detail(&db, "r-1").unwrap().unwrap();
        assert_eq!(stored.report, report);
        assert_eq!(stored.message_count, 10);
        assert!(detail(&db, "missing").unwrap().is_none());
    }

    #[test]
    fn duplicate_report_id_is_not_inserted() {
        let db = Database::open_in_memory().unwrap();
        let report = sample_report("r-1", "example.com", 10);
        assert!(store(&db, &report).is_some());
        assert!(store(&db, &report).is_none());

        assert_eq!(count(&db).unwrap(), 1);
        let records: u32 = db
            .with_conn(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM records", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(records, 2);
    }

    #[test]
    fn list_applies_filters() {
        let db = Database::open_in_memory().unwrap();
        store(&db, &sample_report("r-1", "example.com", 10));
        store(&db, &sample_report("r-2", "example.org", 12));
        store(&db, &sample_report("r-3", "example.com", 14));

        let all = list(&db, &ReportFilter::default()).unwrap();
        let ids: Vec<&str> = all.iter().map(|r| r.report_id.as_str()).collect();
        assert_eq!(ids, vec!["r-3", "r-2", "r-1"]);
        assert_eq!(all[0].message_count, 10);
        assert_eq!(all[0].record_count, 2);

        let cases: Vec<(ReportFilter, Vec<&str>)> = vec![
            (
                ReportFilter {
                    domain: Some("Example.com".to_string()),
                    ..Default::default()
                },
                vec!["r-3", "r-1"],
            ),
            (
                ReportFilter {
                    search: Some("org".to_string()),
                    ..Default::default()
                },
                vec!["r-2"],
            ),
            (
                ReportFilter {
                    from: Some(Utc.with_ymd_and_hms(2026, 3, 12, 0, 0, 0).unwrap()),
                    ..Default::default()
                },
                vec!["r-3", "r-2"],
            ),
            (
                ReportFilter {
                    to: Some(Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap()),
                    ..Default::default()
                },
                vec!["r-1"],
            ),
            (
                ReportFilter {
                    limit: Some(1),
                    offset: Some(1),
                    ..Default::default()
                },
                vec!["r-2"],
            ),
        ];

        for (filter, expected) in cases {
            let found = list(&db, &filter).unwrap();
            let ids: Vec<&str> = found.iter().map(|r| r.report_id.as_str()).collect();
            assert_eq!(ids, expected, "{:?}", filter);
        }
    }

    #[test]
    fn delete_before_cascades() {
        let db = Database::open_in_memory().unwrap();
        store(&db, &sample_report("old", "example.com", 2));
        store(&db, &sample_report("new", "example.com", 20));

        let cutoff = Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap();
        assert_eq!(delete_before(&db, cutoff).unwrap(), 1);
        assert!(!exists(&db, "old").unwrap());
        assert!(exists(&db, "new").unwrap());

        let (records, dkim): (u32, u32) = db
            .with_conn(|conn| {
                Ok(conn.query_row(
                    "SELECT (SELECT COUNT(*) FROM records), (SELECT COUNT(*) FROM dkim_auth)",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )?)
            })
            .unwrap();
        assert_eq!(records, 2);
        assert_eq!(dkim, 1);
    }
}
