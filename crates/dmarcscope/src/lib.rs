pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod logging;
pub mod report;
pub mod secrets;
pub mod source;

pub use analytics::{
    detect_issues, domain_aggregate, domain_aggregates, source_health, source_health_list,
    timeline, Finding, IssueThresholds, Scope, Severity, SourceHealth, TimelinePoint,
    TimelineQuery,
};
pub use config::{load_config, load_effective_config, Config, MailboxConfig};
pub use db::{Database, DatabaseError, DatabaseLocation};
pub use error::{ConfigError, DmarcError, Result, WorkerError};
pub use ingest::{FailureKind, ImportSummary, IngestOutcome, IngestPool, Ingestor, MailboxPoller};
pub use logging::{init_logging, LogFormat};
pub use report::{parse_document, ParseError, ParsedReport, Report};
pub use secrets::{resolve_secret, SecretError};
pub use source::{LocalSource, MailboxSource, SourceDocument, SourceError, SourceKind};
