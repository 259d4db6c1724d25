use serde::{Deserialize, Serialize};

use crate::analytics::IssueThresholds;
use crate::db::DatabaseLocation;
use crate::logging::LogFormat;

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailbox: Option<MailboxConfig>,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub analytics: IssueThresholds,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            mailbox: None,
            import: ImportConfig::default(),
            analytics: IssueThresholds::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_version() -> String {
    CONFIG_VERSION.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatabaseConfig {
    /// File path or `sqlite:` URL. Defaults to `~/.dmarcscope/data/dmarcscope.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl DatabaseConfig {
    /// Where the store lives, or `None` when no default home directory exists.
    pub fn location(&self) -> Option<DatabaseLocation> {
        match self.url.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
            Some(url) => Some(DatabaseLocation::parse(url)),
            None => crate::db::default_database_path().map(DatabaseLocation::File),
        }
    }
}

/// IMAP mailbox that receives aggregate reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailboxConfig {
    pub host: String,

    #[serde(default = "default_imap_port")]
    pub port: u16,

    /// Plain-text IMAP is rejected at validation time.
    #[serde(default = "default_true")]
    pub use_tls: bool,

    pub username: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env_var: Option<String>,

    #[serde(default = "default_inbox")]
    pub folder: String,

    /// Only search messages received within this many days.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_days: Option<u32>,

    /// Seconds between poll cycles.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Message bodies fetched per IMAP round trip.
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Attachments above this size (bytes) are skipped.
    #[serde(default = "default_max_attachment_size")]
    pub max_attachment_size: u64,
}

impl MailboxConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_imap_port(),
            use_tls: true,
            username: username.into(),
            password: None,
            password_file: None,
            password_env_var: None,
            folder: default_inbox(),
            since_days: None,
            poll_interval: default_poll_interval(),
            batch_size: default_batch_size(),
            connect_timeout_secs: default_connect_timeout(),
            max_attachment_size: default_max_attachment_size(),
        }
    }
}

fn default_imap_port() -> u16 {
    993
}

fn default_inbox() -> String {
    "INBOX".to_string()
}

fn default_poll_interval() -> u64 {
    3600
}

fn default_batch_size() -> u32 {
    50
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_max_attachment_size() -> u64 {
    26_214_400 // 25 MiB
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportConfig {
    /// Directory scanned by `import` when no paths are given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,

    #[serde(default = "default_true")]
    pub recursive: bool,

    #[serde(default = "default_worker_count")]
    pub workers: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            directory: None,
            recursive: true,
            workers: default_worker_count(),
        }
    }
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
