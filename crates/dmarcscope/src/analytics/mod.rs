//! Read-only analytics over the report store.
//!
//! Every query goes through the reader connection, so results only ever
//! reflect committed reports.

pub mod domains;
pub mod health;
pub mod issues;
pub mod timeline;

pub use domains::{domain_aggregate, domain_aggregates, DomainAggregate};
pub use health::{source_health, source_health_list, HealthStatus, MechanismHealth, SourceHealth};
pub use issues::{
    detect_issues, AggregateSnapshot, Entity, Finding, IssueKind, IssueThresholds, Severity,
};
pub use timeline::{timeline, Scope, TimelinePoint, TimelineQuery};

/// `part` as a percentage of `whole`; zero when `whole` is zero.
pub(crate) fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 * 100.0) / whole as f64
}
