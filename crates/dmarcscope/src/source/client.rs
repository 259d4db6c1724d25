//! IMAP client for the report mailbox.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use async_imap::Session;
use async_native_tls::TlsConnector;
use futures_util::StreamExt;
use log::{debug, info, warn};
use secrecy::{ExposeSecret, SecretString};

use crate::config::MailboxConfig;

use super::attachments::normalize_message_id;
use super::error::{Result, SourceError};

type AsyncTcpStream = async_io::Async<TcpStream>;
type TlsStream = async_native_tls::TlsStream<AsyncTcpStream>;

/// Read-only IMAP session over TLS.
pub struct ImapClient {
    session: Option<Session<TlsStream>>,
    config: MailboxConfig,
    current_uidvalidity: Option<u32>,
}

impl ImapClient {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            session: None,
            config,
            current_uidvalidity: None,
        }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs.max(1))
    }

    /// Connects, negotiates TLS and logs in, all within the configured
    /// connect timeout.
    pub async fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            debug!("Already connected to IMAP server");
            return Ok(());
        }

        if !self.config.use_tls {
            return Err(SourceError::Config(
                "TLS is required for mailbox connections".to_string(),
            ));
        }

        let password = self.password()?;
        let timeout = self.connect_timeout();
        let session = tokio::time::timeout(timeout, self.establish(password))
            .await
            .map_err(|_| SourceError::Timeout {
                action: "connecting to the IMAP server",
                seconds: timeout.as_secs(),
            })??;

        info!("Authenticated to IMAP server as {}", self.config.username);
        self.session = Some(session);
        Ok(())
    }

    async fn establish(&self, password: SecretString) -> Result<Session<TlsStream>> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to IMAP server at {}", addr);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SourceError::Connection(format!("{}: {}", addr, e)))?
            .next()
            .ok_or_else(|| SourceError::Connection(format!("{}: no address found", addr)))?;

        let std_stream = TcpStream::connect_timeout(&socket_addr, self.connect_timeout())
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        std_stream
            .set_nonblocking(true)
            .map_err(|e| SourceError::Connection(e.to_string()))?;
        let tcp_stream =
            async_io::Async::new(std_stream).map_err(|e| SourceError::Connection(e.to_string()))?;

        let tls_stream = TlsConnector::new()
            .connect(&self.config.host, tcp_stream)
            .await?;

        async_imap::Client::new(tls_stream)
            .login(&self.config.username, password.expose_secret())
            .await
            .map_err(|(e, _)| SourceError::Authentication(e.to_string()))
    }

    fn password(&self) -> Result<SecretString> {
        if self.config.password.as_deref().is_some_and(|p| !p.is_empty()) {
            warn!("Using an inline mailbox password; prefer passwordFile or passwordEnvVar");
        }
        Ok(crate::secrets::resolve_secret(
            self.config.password.as_deref(),
            self.config.password_file.as_deref(),
            self.config.password_env_var.as_deref(),
        )?)
    }

    fn session(&mut self) -> Result<&mut Session<TlsStream>> {
        self.session
            .as_mut()
            .ok_or_else(|| SourceError::Connection("Not connected".to_string()))
    }

    /// Opens a folder with EXAMINE so nothing in it changes, and returns its
    /// UIDVALIDITY.
    pub async fn examine_folder(&mut self, folder: &str) -> Result<u32> {
        let session = self.session()?;
        info!("Examining folder: {}", folder);

        let mailbox = session.examine(folder).await.map_err(|e| match e {
            async_imap::error::Error::No(_) => SourceError::FolderNotFound(folder.to_string()),
            other => SourceError::Protocol(other.to_string()),
        })?;

        // Servers that omit UIDVALIDITY get a fixed epoch of 0.
        let uidvalidity = mailbox.uid_validity.unwrap_or(0);
        self.current_uidvalidity = Some(uidvalidity);
        debug!("Folder '{}' opened with UIDVALIDITY={}", folder, uidvalidity);
        Ok(uidvalidity)
    }

    pub fn uidvalidity(&self) -> Option<u32> {
        self.current_uidvalidity
    }

    /// UID SEARCH with the given criterion (`ALL`, `SINCE 01-Jan-2026`).
    /// UIDs come back in ascending order.
    pub async fn search(&mut self, criterion: &str) -> Result<Vec<u32>> {
        let session = self.session()?;
        debug!("Searching with query: {}", criterion);

        let uids = session
            .uid_search(criterion)
            .await
            .map_err(|e| SourceError::Protocol(e.to_string()))?;

        let mut uid_list: Vec<u32> = uids.into_iter().collect();
        uid_list.sort_unstable();
        debug!("Found {} messages matching search", uid_list.len());
        Ok(uid_list)
    }

    /// Fetches the Message-ID of each UID from its envelope, without
    /// downloading bodies.
    pub async fn fetch_message_ids(&mut self, uids: &[u32]) -> Result<Vec<(u32, Option<String>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session()?;

        let mut messages = session
            .uid_fetch(uid_set(uids), "(UID ENVELOPE)")
            .await
            .map_err(|e| SourceError::Protocol(e.to_string()))?;

        let mut results = Vec::with_capacity(uids.len());
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| SourceError::Protocol(e.to_string()))?;
            let Some(uid) = message.uid else {
                warn!("Envelope response without UID");
                continue;
            };
            let message_id = message
                .envelope()
                .and_then(|env| env.message_id.as_deref())
                .map(|raw| normalize_message_id(&String::from_utf8_lossy(raw)))
                .filter(|id| !id.is_empty());
            results.push((uid, message_id));
        }
        Ok(results)
    }

    /// Fetches full messages with BODY.PEEK[] so the \Seen flag is untouched.
    pub async fn fetch_bodies(&mut self, uids: &[u32]) -> Result<Vec<(u32, Vec<u8>)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let session = self.session()?;
        debug!("Fetching {} message bodies", uids.len());

        let mut messages = session
            .uid_fetch(uid_set(uids), "(UID BODY.PEEK[])")
            .await
            .map_err(|e| SourceError::Protocol(e.to_string()))?;

        let mut results = Vec::with_capacity(uids.len());
        while let Some(message) = messages.next().await {
            let message = message.map_err(|e| SourceError::Protocol(e.to_string()))?;
            match (message.uid, message.body()) {
                (Some(uid), Some(body)) => results.push((uid, body.to_vec())),
                _ => warn!("Message missing UID or body"),
            }
        }
        Ok(results)
    }

    pub async fn disconnect(&mut self) -> Result<()> {
        if let Some(mut session) = self.session.take() {
            info!("Disconnecting from IMAP server");
            session
                .logout()
                .await
                .map_err(|e| SourceError::Protocol(e.to_string()))?;
        }
        self.current_uidvalidity = None;
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }
}

impl Drop for ImapClient {
    fn drop(&mut self) {
        if self.session.is_some() {
            warn!("ImapClient dropped without explicit disconnect");
        }
    }
}

/// Builds an IMAP sequence set such as `3,7,9`.
fn uid_set(uids: &[u32]) -> String {
    uids.iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// IMAP date for `SINCE`, e.g. `05-Mar-2026`.
pub fn imap_date(date: chrono::NaiveDate) -> String {
    date.format("%d-%b-%Y").to_string()
}
