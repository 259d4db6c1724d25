//! Periodic mailbox polling on a dedicated thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::source::{CycleStats, MailboxSource, Result, SourceDocument};

use super::{IngestOutcome, Ingestor};

/// Runs mailbox cycles every `interval`, or on demand via [`trigger`].
/// Cycles never overlap: the loop awaits each one before waiting again.
///
/// [`trigger`]: MailboxPoller::trigger
pub struct MailboxPoller {
    source: Arc<MailboxSource>,
    ingestor: Ingestor,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    trigger_tx: broadcast::Sender<()>,
}

impl MailboxPoller {
    pub fn new(source: MailboxSource, ingestor: Ingestor) -> Self {
        let interval = Duration::from_secs(source.config().poll_interval.max(1));
        let (trigger_tx, _) = broadcast::channel(4);
        Self {
            source: Arc::new(source),
            ingestor,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger_tx,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Runs a single cycle, ingesting every document it yields.
    pub async fn run_once(&self) -> Result<CycleStats> {
        poll_cycle(&self.source, &self.ingestor).await
    }

    /// Starts the loop on a background thread. The first cycle runs
    /// immediately.
    pub fn start(&self) -> JoinHandle<()> {
        let source = Arc::clone(&self.source);
        let ingestor = self.ingestor.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let mut trigger_rx = self.trigger_tx.subscribe();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Failed to start poller runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            info!("Manual mailbox poll triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    if let Err(e) = poll_cycle(&source, &ingestor).await {
                        error!("Mailbox cycle failed, retrying next tick: {}", e);
                    }
                }
                info!("Mailbox poller stopped");
            });
        })
    }

    /// Requests an immediate cycle.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.send(());
    }

    /// Stops the loop. An in-flight cycle finishes first.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.trigger_tx.send(());
    }
}

async fn poll_cycle(source: &MailboxSource, ingestor: &Ingestor) -> Result<CycleStats> {
    source
        .run_cycle(|document: SourceDocument| {
            ingestor.ingest(&document).map(|outcome| {
                if let IngestOutcome::Failed { reason, .. } = outcome {
                    info!(source_id = %document.source_id, "Attachment rejected: {}", reason);
                }
            })
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MailboxConfig;
    use crate::db::Database;
    use crate::source::SourceError;

    fn unreachable_source(db: &Database) -> MailboxSource {
        let mut config = MailboxConfig::new("127.0.0.1", "dmarc@example.com");
        config.port = 1;
        config.password = Some("secret".to_string());
        config.connect_timeout_secs = 2;
        MailboxSource::new(config, db.clone())
    }

    #[tokio::test]
    async fn test_run_once_surfaces_connection_failure() {
        let db = Database::open_in_memory().unwrap();
        let poller = MailboxPoller::new(unreachable_source(&db), Ingestor::new(db));
        let result = poller.run_once().await;
        assert!(matches!(
            result,
            Err(SourceError::Connection(_)) | Err(SourceError::Timeout { .. })
        ));
    }

    #[test]
    fn test_poller_survives_failed_cycles_and_stops() {
        let db = Database::open_in_memory().unwrap();
        let poller = MailboxPoller::new(unreachable_source(&db), Ingestor::new(db))
            .with_interval(Duration::from_millis(50));

        let handle = poller.start();
        std::thread::sleep(Duration::from_millis(150));
        poller.trigger();
        std::thread::sleep(Duration::from_millis(50));
        poller.stop();

        handle.join().expect("poller thread panicked");
    }
}
