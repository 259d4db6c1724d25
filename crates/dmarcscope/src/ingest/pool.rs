//! Bounded worker pool for local imports.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::WorkerError;
use crate::source::{LocalSource, SourceDocument};

use super::{IngestOutcome, Ingestor};

pub enum IngestJob {
    /// Read from disk inside the worker.
    File(PathBuf),
    Document(SourceDocument),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum PoolOutcome {
    Done(IngestOutcome),
    /// The file could not be read; nothing was recorded.
    Unreadable,
    /// The ledger itself could not be written.
    Error { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolResult {
    pub origin: String,
    pub outcome: PoolOutcome,
}

pub struct IngestPool {
    job_sender: Sender<IngestJob>,
    result_receiver: Receiver<PoolResult>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl IngestPool {
    pub fn new(ingestor: Ingestor, worker_count: usize) -> Result<Self, WorkerError> {
        let worker_count = worker_count.max(1);
        let (job_sender, job_receiver) = bounded::<IngestJob>(worker_count * 2);
        let (result_sender, result_receiver) = unbounded::<PoolResult>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let job_rx = job_receiver.clone();
            let result_tx = result_sender.clone();
            let shutdown_flag = Arc::clone(&shutdown);
            let worker_ingestor = ingestor.clone();

            let handle = thread::Builder::new()
                .name(format!("ingest-{}", worker_id))
                .spawn(move || {
                    run_worker(worker_id, job_rx, result_tx, shutdown_flag, worker_ingestor)
                })
                .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?;
            workers.push(handle);
        }

        info!("Started {} ingest workers", worker_count);

        Ok(Self {
            job_sender,
            result_receiver,
            workers,
            shutdown,
        })
    }

    pub fn submit(&self, job: IngestJob) -> Result<(), WorkerError> {
        if self.shutdown.load(Ordering::Relaxed) {
            return Err(WorkerError::ChannelClosed);
        }
        self.job_sender
            .send(job)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Blocks for the next result. `None` once every worker has exited.
    pub fn recv_result(&self) -> Option<PoolResult> {
        self.result_receiver.recv().ok()
    }

    /// Flag that makes workers stop after their current document.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown(&self) {
        info!("Shutting down ingest pool...");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn wait(self) {
        drop(self.job_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("Worker {} panicked: {:?}", i, e);
            } else {
                debug!("Worker {} finished", i);
            }
        }
    }
}

fn run_worker(
    worker_id: usize,
    job_receiver: Receiver<IngestJob>,
    result_sender: Sender<PoolResult>,
    shutdown: Arc<AtomicBool>,
    ingestor: Ingestor,
) {
    debug!("Worker {} started", worker_id);
    let local = LocalSource::default();

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("Worker {} received shutdown signal", worker_id);
            break;
        }

        let job = match job_receiver.recv_timeout(Duration::from_millis(100)) {
            Ok(job) => job,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let (origin, document) = match job {
            IngestJob::File(path) => (path.display().to_string(), local.load(&path)),
            IngestJob::Document(doc) => (
                doc.origin.clone().unwrap_or_else(|| doc.source_id.clone()),
                Some(doc),
            ),
        };

        let outcome = match document {
            None => PoolOutcome::Unreadable,
            Some(doc) => match ingestor.ingest(&doc) {
                Ok(outcome) => PoolOutcome::Done(outcome),
                Err(e) => {
                    error!("Worker {} could not record {}: {}", worker_id, origin, e);
                    PoolOutcome::Error {
                        message: e.to_string(),
                    }
                }
            },
        };

        if result_sender.send(PoolResult { origin, outcome }).is_err() {
            break;
        }
    }

    debug!("Worker {} stopped", worker_id);
}

/// Totals for one import run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub files: usize,
    pub ingested: usize,
    pub duplicates: usize,
    pub already_processed: usize,
    pub failed: usize,
    pub unreadable: usize,
    pub errors: usize,
}

impl ImportSummary {
    pub fn record(&mut self, outcome: &PoolOutcome) {
        match outcome {
            PoolOutcome::Done(IngestOutcome::Ingested { .. }) => self.ingested += 1,
            PoolOutcome::Done(IngestOutcome::Duplicate { .. }) => self.duplicates += 1,
            PoolOutcome::Done(IngestOutcome::AlreadyProcessed) => self.already_processed += 1,
            PoolOutcome::Done(IngestOutcome::Failed { .. }) => self.failed += 1,
            PoolOutcome::Unreadable => self.unreadable += 1,
            PoolOutcome::Error { .. } => self.errors += 1,
        }
    }
}

/// Imports the given files through a pool of `workers` threads and waits for
/// every result.
pub fn import_files(
    ingestor: &Ingestor,
    files: Vec<PathBuf>,
    workers: usize,
) -> Result<ImportSummary, WorkerError> {
    let pool = IngestPool::new(ingestor.clone(), workers)?;
    let mut summary = ImportSummary {
        files: files.len(),
        ..ImportSummary::default()
    };

    let feeder = {
        let sender = pool.job_sender.clone();
        let shutdown = pool.shutdown_handle();
        thread::Builder::new()
            .name("ingest-feeder".to_string())
            .spawn(move || {
                for path in files {
                    if shutdown.load(Ordering::Relaxed) {
                        break;
                    }
                    if sender.send(IngestJob::File(path)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| WorkerError::SpawnFailed(e.to_string()))?
    };

    for _ in 0..summary.files {
        let Some(result) = pool.recv_result() else {
            break;
        };
        summary.record(&result.outcome);
    }

    if feeder.join().is_err() {
        error!("Feeder thread panicked");
    }
    pool.wait();

    info!(
        files = summary.files,
        ingested = summary.ingested,
        duplicates = summary.duplicates,
        failed = summary.failed,
        "Import finished"
    );
    Ok(summary)
}
