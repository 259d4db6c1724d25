//! Mailbox adapter: one poll cycle over the configured IMAP folder.

use std::collections::HashSet;
use std::fmt::Display;

use chrono::{Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::MailboxConfig;
use crate::db::ledger::{self, LedgerEntry, LedgerStatus};
use crate::db::Database;

use super::attachments::extract_report_attachments;
use super::client::{imap_date, ImapClient};
use super::error::Result;
use super::{SourceDocument, SourceKind};

const ENVELOPE_CHUNK: usize = 500;

/// Counters for one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleStats {
    pub messages_found: usize,
    pub messages_skipped: usize,
    pub messages_scanned: usize,
    pub documents: usize,
    pub handler_errors: usize,
}

pub struct MailboxSource {
    config: MailboxConfig,
    db: Database,
}

impl MailboxSource {
    pub fn new(config: MailboxConfig, db: Database) -> Self {
        Self { config, db }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Runs one cycle, handing every report attachment to `handle`.
    ///
    /// Messages already marked `scanned` in the ledger are skipped before
    /// their bodies are downloaded. A message is marked once every one of
    /// its attachments was handled without error. Connection, login and
    /// protocol failures abort the cycle.
    pub async fn run_cycle<F, E>(&self, mut handle: F) -> Result<CycleStats>
    where
        F: FnMut(SourceDocument) -> std::result::Result<(), E>,
        E: Display,
    {
        let span = info_span!(
            "mailbox_cycle",
            host = %self.config.host,
            folder = %self.config.folder
        );
        async move {
            let mut client = ImapClient::new(self.config.clone());
            client.connect().await?;

            let result = self.scan(&mut client, &mut handle).await;
            if let Err(e) = client.disconnect().await {
                warn!("Failed to log out cleanly: {}", e);
            }

            if let Ok(stats) = &result {
                info!(
                    found = stats.messages_found,
                    skipped = stats.messages_skipped,
                    scanned = stats.messages_scanned,
                    documents = stats.documents,
                    "Mailbox cycle complete"
                );
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn scan<F, E>(&self, client: &mut ImapClient, handle: &mut F) -> Result<CycleStats>
    where
        F: FnMut(SourceDocument) -> std::result::Result<(), E>,
        E: Display,
    {
        let uidvalidity = client.examine_folder(&self.config.folder).await?;
        let criterion = search_criterion(self.config.since_days, Utc::now().date_naive());
        let uids = client.search(&criterion).await?;

        let mut stats = CycleStats {
            messages_found: uids.len(),
            ..CycleStats::default()
        };
        if uids.is_empty() {
            info!("No messages to examine");
            return Ok(stats);
        }

        let mut envelopes = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(ENVELOPE_CHUNK) {
            envelopes.extend(client.fetch_message_ids(chunk).await?);
        }

        let pending = self.pending_messages(envelopes, uidvalidity)?;
        stats.messages_skipped = stats.messages_found.saturating_sub(pending.len());
        info!(pending = pending.len(), "Messages awaiting scan");

        let batch_size = self.config.batch_size.max(1) as usize;
        for batch in pending.chunks(batch_size) {
            let batch_uids: Vec<u32> = batch.iter().map(|m| m.uid).collect();
            let bodies = client.fetch_bodies(&batch_uids).await?;

            for (uid, raw) in bodies {
                let Some(message) = batch.iter().find(|m| m.uid == uid) else {
                    warn!(uid, "Server returned an unrequested message");
                    continue;
                };
                let outcome = process_message(
                    &self.db,
                    message,
                    &raw,
                    self.config.max_attachment_size,
                    handle,
                );
                stats.documents += outcome.documents;
                stats.handler_errors += outcome.errors;
                if outcome.marked {
                    stats.messages_scanned += 1;
                }
            }
        }

        Ok(stats)
    }

    fn pending_messages(
        &self,
        envelopes: Vec<(u32, Option<String>)>,
        uidvalidity: u32,
    ) -> Result<Vec<PendingMessage>> {
        let messages: Vec<PendingMessage> = envelopes
            .into_iter()
            .map(|(uid, message_id)| PendingMessage::new(uid, message_id, uidvalidity))
            .collect();
        let keys: Vec<String> = messages.iter().map(|m| m.key.clone()).collect();
        let scanned = ledger::scanned_among(&self.db, &keys)?;
        Ok(filter_unscanned(messages, &scanned))
    }
}

/// A message selected for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingMessage {
    pub uid: u32,
    pub message_id: Option<String>,
    /// Ledger key: the Message-ID, or `imap:<uidvalidity>:<uid>` without one.
    pub key: String,
}

impl PendingMessage {
    pub fn new(uid: u32, message_id: Option<String>, uidvalidity: u32) -> Self {
        let key = message_key(message_id.as_deref(), uidvalidity, uid);
        Self {
            uid,
            message_id,
            key,
        }
    }
}

pub fn message_key(message_id: Option<&str>, uidvalidity: u32, uid: u32) -> String {
    match message_id {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => format!("imap:{}:{}", uidvalidity, uid),
    }
}

pub fn attachment_source_id(message_key: &str, index: usize) -> String {
    format!("{}#{}", message_key, index)
}

pub fn search_criterion(since_days: Option<u32>, today: NaiveDate) -> String {
    match since_days {
        Some(days) => format!("SINCE {}", imap_date(today - Duration::days(i64::from(days)))),
        None => "ALL".to_string(),
    }
}

fn filter_unscanned(
    messages: Vec<PendingMessage>,
    scanned: &HashSet<String>,
) -> Vec<PendingMessage> {
    // The same Message-ID can appear under several UIDs (copies); keep one.
    let mut seen = HashSet::new();
    messages
        .into_iter()
        .filter(|m| !scanned.contains(&m.key) && seen.insert(m.key.clone()))
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MessageOutcome {
    documents: usize,
    errors: usize,
    marked: bool,
}

/// Extracts the attachments of one downloaded message, hands each to
/// `handle`, and records the `scanned` marker when all succeeded.
fn process_message<F, E>(
    db: &Database,
    message: &PendingMessage,
    raw: &[u8],
    max_attachment_size: u64,
    handle: &mut F,
) -> MessageOutcome
where
    F: FnMut(SourceDocument) -> std::result::Result<(), E>,
    E: Display,
{
    let mut outcome = MessageOutcome::default();

    let (attachments, parsed_id) = match extract_report_attachments(raw, max_attachment_size) {
        Some(extracted) => (extracted.attachments, extracted.message_id),
        None => {
            warn!(uid = message.uid, key = %message.key, "Unparseable message, marking as scanned");
            (Vec::new(), None)
        }
    };
    let key = document_key(message, parsed_id);
    debug!(uid = message.uid, key = %key, attachments = attachments.len(), "Message downloaded");

    for attachment in attachments {
        let document = SourceDocument::new(
            attachment.content,
            attachment_source_id(&key, attachment.index),
            SourceKind::Mailbox,
        )
        .with_origin(origin(&key, attachment.filename.as_deref()))
        .with_hint(attachment.hint);

        outcome.documents += 1;
        if let Err(e) = handle(document) {
            error!(
                uid = message.uid,
                index = attachment.index,
                "Failed to handle attachment: {}",
                e
            );
            outcome.errors += 1;
        }
    }

    if outcome.errors == 0 {
        let entry = LedgerEntry::new(&message.key, SourceKind::Mailbox, LedgerStatus::Scanned)
            .with_origin(message.message_id.clone());
        match ledger::insert(db, &entry) {
            Ok(_) => outcome.marked = true,
            Err(e) => error!(key = %message.key, "Failed to record scanned message: {}", e),
        }
    }
    outcome
}

/// Key for attachment source ids. When the envelope carried no Message-ID
/// the header parsed from the body is used, so the ids stay stable across
/// UIDVALIDITY changes. The `scanned` marker keeps the envelope key, since
/// that is what the next cycle looks up before downloading.
fn document_key(message: &PendingMessage, parsed_id: Option<String>) -> String {
    let envelope_has_id = message.message_id.as_deref().is_some_and(|id| !id.is_empty());
    match parsed_id {
        Some(id) if !envelope_has_id && !id.is_empty() => id,
        _ => message.key.clone(),
    }
}

fn origin(key: &str, filename: Option<&str>) -> String {
    match filename {
        Some(name) => format!("{} ({})", key, name),
        None => key.to_string(),
    }
}
