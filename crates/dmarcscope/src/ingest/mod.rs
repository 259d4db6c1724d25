//! Ingestion: the ledger gate, parsing and transactional persistence of one
//! document at a time.

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn};

use crate::db::ledger::{self, LedgerEntry, LedgerStatus};
use crate::db::{report_repo, Database, DatabaseError, TxOutcome};
use crate::report::{parse_document, ParseWarning};
use crate::source::SourceDocument;

pub mod pool;
pub mod poller;

pub use pool::{import_files, ImportSummary, IngestJob, IngestPool, PoolOutcome, PoolResult};
pub use poller::MailboxPoller;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// The document could not be decoded or lacked required fields.
    Malformed,
    /// The store rejected the write.
    PersistenceConflict,
}

/// What happened to one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum IngestOutcome {
    #[serde(rename_all = "camelCase")]
    Ingested {
        report_id: String,
        records: usize,
        warnings: Vec<ParseWarning>,
    },
    /// The report id was already stored, possibly via another channel.
    #[serde(rename_all = "camelCase")]
    Duplicate { report_id: String },
    /// The source id is already in the ledger. Nothing was parsed.
    AlreadyProcessed,
    Failed { kind: FailureKind, reason: String },
}

/// Applies documents to the store. Cheap to clone; every worker thread gets
/// its own copy.
#[derive(Clone)]
pub struct Ingestor {
    db: Database,
}

impl Ingestor {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Ingests one document.
    ///
    /// Only errors writing the ledger itself are returned as `Err`; parse
    /// and persistence problems become [`IngestOutcome::Failed`] and are
    /// recorded so the document is not retried.
    pub fn ingest(&self, document: &SourceDocument) -> Result<IngestOutcome, DatabaseError> {
        let _span = info_span!(
            "ingest",
            source_id = %document.source_id,
            kind = %document.kind
        )
        .entered();

        if ledger::exists(&self.db, &document.source_id)? {
            debug!("Source already in ledger");
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        let parsed = match parse_document(&document.bytes, document.hint) {
            Ok(parsed) => parsed,
            Err(e) => {
                let reason = e.to_string();
                warn!(origin = ?document.origin, "Malformed report document: {}", reason);
                return self.record_failure(document, None, FailureKind::Malformed, reason);
            }
        };

        let report = &parsed.report;
        let report_id = report.report_id.clone();
        let result = self.db.with_tx(|tx| {
            let inserted = report_repo::insert_in(tx, report, Utc::now())?;
            let (status, outcome) = match inserted {
                None => (
                    LedgerStatus::Duplicate,
                    IngestOutcome::Duplicate {
                        report_id: report_id.clone(),
                    },
                ),
                Some(_) => (
                    LedgerStatus::Ingested,
                    IngestOutcome::Ingested {
                        report_id: report_id.clone(),
                        records: report.records.len(),
                        warnings: parsed.warnings.clone(),
                    },
                ),
            };

            let mut entry = LedgerEntry::new(&document.source_id, document.kind, status)
                .with_report_id(&report_id)
                .with_origin(document.origin.clone());
            if status == LedgerStatus::Ingested {
                entry = entry.with_warnings(parsed.warnings.clone());
            }

            if ledger::insert_in(tx, &entry)? {
                Ok(TxOutcome::Commit(outcome))
            } else {
                Ok(TxOutcome::Rollback(IngestOutcome::AlreadyProcessed))
            }
        });

        match result {
            Ok(outcome) => {
                match &outcome {
                    IngestOutcome::Ingested { records, warnings, .. } => info!(
                        report_id = %report_id,
                        domain = %report.policy.domain,
                        records,
                        warnings = warnings.len(),
                        "Report ingested"
                    ),
                    IngestOutcome::Duplicate { .. } => {
                        info!(report_id = %report_id, "Duplicate report skipped")
                    }
                    _ => debug!("Another writer recorded this source first"),
                }
                Ok(outcome)
            }
            Err(e) => {
                error!(report_id = %report_id, "Persisting report failed: {}", e);
                let reason = format!("persistence conflict: {}", e);
                self.record_failure(
                    document,
                    Some(report_id),
                    FailureKind::PersistenceConflict,
                    reason,
                )
            }
        }
    }

    fn record_failure(
        &self,
        document: &SourceDocument,
        report_id: Option<String>,
        kind: FailureKind,
        reason: String,
    ) -> Result<IngestOutcome, DatabaseError> {
        let mut entry = LedgerEntry::new(&document.source_id, document.kind, LedgerStatus::Failed)
            .with_error(&reason)
            .with_origin(document.origin.clone());
        if let Some(id) = report_id {
            entry = entry.with_report_id(id);
        }

        if ledger::insert(&self.db, &entry)? {
            Ok(IngestOutcome::Failed { kind, reason })
        } else {
            Ok(IngestOutcome::AlreadyProcessed)
        }
    }
}
