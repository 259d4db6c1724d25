//! Daily message volumes.
//!
//! A report lands on exactly one UTC day: the day holding the last second of
//! its period. Reports ending on a midnight boundary therefore count towards
//! the day they cover rather than the next one.

use std::collections::HashMap;

use chrono::{DateTime, Days, NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;

use crate::db::{Database, DatabaseError};
use crate::report::canonical_ip;

/// Restricts a timeline to one policy domain or one sending IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Scope {
    Domain(String),
    Source(String),
}

/// Longest window a timeline covers, about ten years.
pub const MAX_TIMELINE_DAYS: u32 = 3650;

#[derive(Debug, Clone)]
pub struct TimelineQuery {
    pub days: u32,
    pub scope: Option<Scope>,
    pub as_of: DateTime<Utc>,
}

impl TimelineQuery {
    /// `days` is clamped to `1..=MAX_TIMELINE_DAYS`.
    pub fn new(days: u32) -> Self {
        Self {
            days: days.clamp(1, MAX_TIMELINE_DAYS),
            scope: None,
            as_of: Utc::now(),
        }
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = as_of;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelinePoint {
    pub date: NaiveDate,
    pub total: u64,
    /// Disposition `none`.
    pub passed: u64,
    pub quarantined: u64,
    pub rejected: u64,
    pub dkim_pass: u64,
    pub spf_pass: u64,
}

/// One point per day in `[as_of - days + 1, as_of]`, oldest first, with
/// zero-filled gaps. `days` is clamped to `1..=MAX_TIMELINE_DAYS`, since the
/// public field can be set directly.
pub fn timeline(db: &Database, query: &TimelineQuery) -> Result<Vec<TimelinePoint>, DatabaseError> {
    let days = query.days.clamp(1, MAX_TIMELINE_DAYS);
    let last = query.as_of.date_naive();
    let first = last
        .checked_sub_days(Days::new(u64::from(days - 1)))
        .unwrap_or(NaiveDate::MIN);

    let window_start = day_start(first);
    let window_end = last
        .checked_add_days(Days::new(1))
        .map(day_start)
        .unwrap_or(i64::MAX);

    let (domain, source) = match &query.scope {
        Some(Scope::Domain(d)) => (Some(d.to_ascii_lowercase()), None),
        Some(Scope::Source(ip)) => (None, Some(canonical_ip(ip))),
        None => (None, None),
    };

    let rows: HashMap<String, TimelinePoint> = db.with_read_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT date(MAX(r.date_range_end - 1, r.date_range_begin), 'unixepoch') AS day,
                    SUM(rec.count),
                    SUM(CASE WHEN rec.disposition = 'none' THEN rec.count ELSE 0 END),
                    SUM(CASE WHEN rec.disposition = 'quarantine' THEN rec.count ELSE 0 END),
                    SUM(CASE WHEN rec.disposition = 'reject' THEN rec.count ELSE 0 END),
                    SUM(CASE WHEN rec.dkim_result = 'pass' THEN rec.count ELSE 0 END),
                    SUM(CASE WHEN rec.spf_result = 'pass' THEN rec.count ELSE 0 END)
             FROM records rec
             JOIN reports r ON r.id = rec.report_id
             WHERE MAX(r.date_range_end - 1, r.date_range_begin) >= ?1
               AND MAX(r.date_range_end - 1, r.date_range_begin) < ?2
               AND (?3 IS NULL OR r.domain = ?3)
               AND (?4 IS NULL OR rec.source_ip = ?4)
             GROUP BY day",
        )?;
        let rows = stmt
            .query_map(params![window_start, window_end, domain, source], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    TimelinePoint {
                        date: NaiveDate::MIN,
                        total: row.get(1)?,
                        passed: row.get(2)?,
                        quarantined: row.get(3)?,
                        rejected: row.get(4)?,
                        dkim_pass: row.get(5)?,
                        spf_pass: row.get(6)?,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(rows)
    })?;

    let mut points = Vec::with_capacity(days as usize);
    let mut day = first;
    while day <= last {
        let key = day.format("%Y-%m-%d").to_string();
        let mut point = rows.get(&key).cloned().unwrap_or_default();
        point.date = day;
        points.push(point);
        match day.succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    Ok(points)
}

fn day_start(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(i64::MIN)
}
