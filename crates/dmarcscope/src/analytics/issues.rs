//! Misconfiguration detection.
//!
//! A snapshot of the store is taken once, then every rule in [`RULES`] runs
//! over it independently. Findings are computed on demand and never stored.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::domains::{domain_aggregates_in, DomainAggregate};
use super::health::{source_health_list_in, SourceHealth};
use super::percent;
use crate::db::report_repo::from_unix;
use crate::db::{Database, DatabaseError};
use crate::report::PolicyAction;

/// Tunable limits for the issue rules. Percentages are whole numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IssueThresholds {
    pub failure_warning_pct: u32,
    pub failure_danger_pct: u32,
    pub min_domain_messages: u64,
    pub dkim_poor_pct: u32,
    pub min_source_messages: u64,
    pub default_cadence_days: u32,
}

impl Default for IssueThresholds {
    fn default() -> Self {
        Self {
            failure_warning_pct: 10,
            failure_danger_pct: 50,
            min_domain_messages: 100,
            dkim_poor_pct: 50,
            min_source_messages: 50,
            default_cadence_days: 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Danger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueKind {
    HighFailureRate,
    PoorDkimSource,
    WeakPolicy,
    StaleReporting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "camelCase")]
pub enum Entity {
    Domain(String),
    Source(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    pub kind: IssueKind,
    pub title: String,
    pub description: String,
    pub recommendation: String,
    pub entity: Entity,
    /// Rate in percent, or days for stale reporting.
    pub metric: f64,
}

/// Everything the rules look at, read in one pass.
#[derive(Debug, Clone)]
pub struct AggregateSnapshot {
    pub as_of: DateTime<Utc>,
    pub domains: Vec<DomainAggregate>,
    pub sources: Vec<SourceHealth>,
    /// Period ends per domain, ascending.
    pub report_ends: BTreeMap<String, Vec<DateTime<Utc>>>,
}

impl AggregateSnapshot {
    /// Reads everything inside one read transaction on the reader, so a
    /// commit landing mid-load cannot mix old and new state.
    pub fn load(db: &Database, as_of: DateTime<Utc>) -> Result<Self, DatabaseError> {
        let (domains, sources, ends) = db.with_read_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let domains = domain_aggregates_in(&tx)?;
            let sources = source_health_list_in(&tx, u32::MAX)?;
            let ends = {
                let mut stmt = tx.prepare(
                    "SELECT domain, date_range_end FROM reports ORDER BY domain, date_range_end",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.commit()?;
            Ok((domains, sources, ends))
        })?;

        let mut report_ends: BTreeMap<String, Vec<DateTime<Utc>>> = BTreeMap::new();
        for (domain, end) in ends {
            report_ends
                .entry(domain)
                .or_default()
                .push(from_unix(end, "date_range_end")?);
        }

        Ok(Self {
            as_of,
            domains,
            sources,
            report_ends,
        })
    }
}

pub type Rule = fn(&AggregateSnapshot, &IssueThresholds) -> Vec<Finding>;

/// Evaluated in this order; each rule is independent of the others.
pub const RULES: &[Rule] = &[
    domain_failure_rate,
    source_dkim_rate,
    weak_policy,
    stale_reporting,
];

pub fn evaluate(snapshot: &AggregateSnapshot, thresholds: &IssueThresholds) -> Vec<Finding> {
    RULES
        .iter()
        .flat_map(|rule| rule(snapshot, thresholds))
        .collect()
}

pub fn detect_issues(
    db: &Database,
    thresholds: &IssueThresholds,
    as_of: DateTime<Utc>,
) -> Result<Vec<Finding>, DatabaseError> {
    let snapshot = AggregateSnapshot::load(db, as_of)?;
    Ok(evaluate(&snapshot, thresholds))
}

/// `part / whole` strictly above `pct` percent, in integers.
fn exceeds(part: u64, whole: u64, pct: u32) -> bool {
    u128::from(part) * 100 > u128::from(whole) * u128::from(pct)
}

pub fn domain_failure_rate(snapshot: &AggregateSnapshot, t: &IssueThresholds) -> Vec<Finding> {
    snapshot
        .domains
        .iter()
        .filter(|d| d.total >= t.min_domain_messages && d.total > 0)
        .filter_map(|d| {
            let failed = d.failed();
            let severity = if exceeds(failed, d.total, t.failure_danger_pct) {
                Severity::Danger
            } else if exceeds(failed, d.total, t.failure_warning_pct) {
                Severity::Warning
            } else {
                return None;
            };
            let rate = percent(failed, d.total);
            Some(Finding {
                severity,
                kind: IssueKind::HighFailureRate,
                title: format!("High DMARC failure rate for {}", d.domain),
                description: format!(
                    "{} of {} messages ({:.1}%) were quarantined or rejected.",
                    failed, d.total, rate
                ),
                recommendation: "Check which sources send on behalf of this domain and make \
                                 sure each one signs with DKIM or is listed in SPF."
                    .to_string(),
                entity: Entity::Domain(d.domain.clone()),
                metric: rate,
            })
        })
        .collect()
}

pub fn source_dkim_rate(snapshot: &AggregateSnapshot, t: &IssueThresholds) -> Vec<Finding> {
    snapshot
        .sources
        .iter()
        .filter(|s| s.total_messages > t.min_source_messages)
        .filter_map(|s| {
            let dkim = s.dkim.as_ref()?;
            let threshold = u128::from(dkim.evaluated) * u128::from(t.dkim_poor_pct);
            if u128::from(dkim.pass) * 100 >= threshold {
                return None;
            }
            Some(Finding {
                severity: Severity::Warning,
                kind: IssueKind::PoorDkimSource,
                title: format!("Low DKIM pass rate from {}", s.source_ip),
                description: format!(
                    "Only {} of {} evaluated messages ({:.1}%) passed DKIM.",
                    dkim.pass, dkim.evaluated, dkim.rate
                ),
                recommendation: "If this is a legitimate sender, configure DKIM signing \
                                 for it; otherwise it may be spoofing your domain."
                    .to_string(),
                entity: Entity::Source(s.source_ip.clone()),
                metric: dkim.rate,
            })
        })
        .collect()
}

pub fn weak_policy(snapshot: &AggregateSnapshot, _t: &IssueThresholds) -> Vec<Finding> {
    snapshot
        .domains
        .iter()
        .filter(|d| d.latest_policy != PolicyAction::Reject)
        .map(|d| Finding {
            severity: Severity::Info,
            kind: IssueKind::WeakPolicy,
            title: format!("{} publishes p={}", d.domain, d.latest_policy),
            description: format!(
                "Messages failing DMARC for {} are not rejected by receivers.",
                d.domain
            ),
            recommendation: "Once all legitimate sources pass, move the policy towards \
                             p=reject."
                .to_string(),
            entity: Entity::Domain(d.domain.clone()),
            metric: d.failure_rate,
        })
        .collect()
}

pub fn stale_reporting(snapshot: &AggregateSnapshot, t: &IssueThresholds) -> Vec<Finding> {
    snapshot
        .report_ends
        .iter()
        .filter_map(|(domain, ends)| {
            let last = *ends.last()?;
            let window = expected_cadence(ends, t.default_cadence_days);
            let silent = snapshot.as_of - last;
            if silent <= window {
                return None;
            }
            let days = silent.num_seconds() as f64 / 86_400.0;
            Some(Finding {
                severity: Severity::Warning,
                kind: IssueKind::StaleReporting,
                title: format!("No recent reports for {}", domain),
                description: format!(
                    "The last report ended {:.1} days ago, beyond the expected window of {:.1} days.",
                    days,
                    window.num_seconds() as f64 / 86_400.0
                ),
                recommendation: "Verify the rua address in the DMARC record and that the \
                                 mailbox is still being polled."
                    .to_string(),
                entity: Entity::Domain(domain.clone()),
                metric: days,
            })
        })
        .collect()
}

/// Twice the mean gap between consecutive report ends, at least one day.
/// With fewer than two reports the default cadence applies.
pub fn expected_cadence(ends: &[DateTime<Utc>], default_days: u32) -> Duration {
    if ends.len() < 2 {
        return Duration::days(i64::from(default_days.max(1)));
    }
    let (Some(first), Some(last)) = (ends.first(), ends.last()) else {
        return Duration::days(i64::from(default_days.max(1)));
    };
    let span = (*last - *first).num_seconds();
    let mean = span / (ends.len() as i64 - 1);
    Duration::seconds(mean * 2).max(Duration::days(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::health::{HealthStatus, MechanismHealth};
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, 0, 0, 0).unwrap()
    }

    fn domain(name: &str, total: u64, failed: u64, policy: PolicyAction) -> DomainAggregate {
        DomainAggregate {
            domain: name.to_string(),
            report_count: 1,
            total,
            passed: total - failed,
            quarantined: failed,
            rejected: 0,
            dkim_pass: total - failed,
            spf_pass: total - failed,
            first_begin: at(1),
            last_end: at(2),
            latest_policy: policy,
            failure_rate: percent(failed, total),
        }
    }

    fn source(ip: &str, total: u64, dkim_pass: u64) -> SourceHealth {
        let status = HealthStatus::classify(dkim_pass, total).unwrap();
        SourceHealth {
            source_ip: ip.to_string(),
            total_messages: total,
            report_count: 1,
            domains: vec!["example.com".to_string()],
            last_seen: Some(at(2)),
            dkim: Some(MechanismHealth {
                pass: dkim_pass,
                evaluated: total,
                rate: percent(dkim_pass, total),
                status,
            }),
            spf: None,
            status,
        }
    }

    fn snapshot(domains: Vec<DomainAggregate>, sources: Vec<SourceHealth>) -> AggregateSnapshot {
        AggregateSnapshot {
            as_of: at(3),
            domains,
            sources,
            report_ends: BTreeMap::new(),
        }
    }

    #[test]
    fn test_failure_rate_thresholds() {
        let t = IssueThresholds::default();
        let cases = [
            (1000, 170, Some(Severity::Warning)),
            (1000, 90, None),
            (1000, 100, None),
            (1000, 101, Some(Severity::Warning)),
            (1000, 501, Some(Severity::Danger)),
            (99, 99, None),
        ];
        for (total, failed, expected) in cases {
            let snap = snapshot(
                vec![domain("example.com", total, failed, PolicyAction::Reject)],
                vec![],
            );
            let findings = domain_failure_rate(&snap, &t);
            let severity = findings.first().map(|f| f.severity);
            assert_eq!(severity, expected, "{}/{}", failed, total);
        }
    }

    #[test]
    fn test_poor_dkim_source_needs_volume() {
        let t = IssueThresholds::default();
        let snap = snapshot(
            vec![],
            vec![
                source("192.0.2.1", 51, 10),
                source("192.0.2.2", 50, 0),
                source("192.0.2.3", 1000, 500),
            ],
        );
        let findings = source_dkim_rate(&snap, &t);
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].entity, Entity::Source("192.0.2.1".into()));
        assert_eq!(findings[0].kind, IssueKind::PoorDkimSource);
    }

    #[test]
    fn test_weak_policy_is_info() {
        let snap = snapshot(
            vec![
                domain("a.example", 10, 0, PolicyAction::None),
                domain("b.example", 10, 0, PolicyAction::Reject),
                domain("c.example", 10, 0, PolicyAction::Quarantine),
            ],
            vec![],
        );
        let findings = weak_policy(&snap, &IssueThresholds::default());
        let names: Vec<_> = findings.iter().map(|f| f.entity.clone()).collect();
        assert_eq!(
            names,
            vec![Entity::Domain("a.example".into()), Entity::Domain("c.example".into())]
        );
        assert!(findings.iter().all(|f| f.severity == Severity::Info));
    }

    #[test]
    fn test_expected_cadence() {
        let cases = [
            (vec![], 7, Duration::days(7)),
            (vec![at(1)], 3, Duration::days(3)),
            (vec![at(1), at(2), at(3)], 7, Duration::days(2)),
            (vec![at(1), at(1)], 7, Duration::days(1)),
            (vec![at(1), at(11)], 7, Duration::days(20)),
        ];
        for (ends, default_days, expected) in cases {
            assert_eq!(expected_cadence(&ends, default_days), expected, "{:?}", ends);
        }
    }

    #[test]
    fn test_stale_reporting() {
        let mut snap = snapshot(vec![], vec![]);
        snap.as_of = at(20);
        snap.report_ends
            .insert("daily.example".into(), vec![at(1), at(2), at(3)]);
        snap.report_ends
            .insert("fresh.example".into(), vec![at(18), at(19)]);
        snap.report_ends.insert("single.example".into(), vec![at(14)]);

        let findings = stale_reporting(&snap, &IssueThresholds::default());
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].entity, Entity::Domain("daily.example".into()));
        assert_eq!(findings[0].metric, 17.0);
    }

    #[test]
    fn test_rules_run_in_order() {
        let snap = snapshot(
            vec![domain("example.com", 1000, 600, PolicyAction::None)],
            vec![source("192.0.2.1", 100, 0)],
        );
        let kinds: Vec<IssueKind> = evaluate(&snap, &IssueThresholds::default())
            .into_iter()
            .map(|f| f.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![IssueKind::HighFailureRate, IssueKind::PoorDkimSource, IssueKind::WeakPolicy]
        );
    }

    #[test]
    fn test_snapshot_ignores_uncommitted_writes() {
        use crate::db::report_repo::{self, tests::{sample_report, store}};
        use crate::db::TxOutcome;

        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("snapshot.db")).unwrap();
        store(&db, &sample_report("r-1", "example.com", 10));

        let snap = db
            .with_tx(|tx| {
                report_repo::insert_in(tx, &sample_report("r-2", "example.com", 12), Utc::now())?;
                let snap = AggregateSnapshot::load(&db, at(13))?;
                Ok(TxOutcome::Rollback(snap))
            })
            .unwrap();

        assert_eq!(snap.domains.len(), 1);
        assert_eq!(snap.domains[0].report_count, 1);
        assert_eq!(snap.domains[0].total, 10);
        assert_eq!(snap.sources.iter().map(|s| s.total_messages).sum::<u64>(), 10);
        assert_eq!(snap.report_ends["example.com"], vec![at(10)]);

        let autocommit = db.with_read_conn(|conn| Ok(conn.is_autocommit())).unwrap();
        assert!(autocommit, "snapshot read transaction left open");
    }
}
