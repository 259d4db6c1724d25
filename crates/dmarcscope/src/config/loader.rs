use std::path::Path;

use tracing::debug;

use crate::config::schema::{Config, MailboxConfig, CONFIG_VERSION};
use crate::error::ConfigError;
use crate::secrets::has_secret_source;

const SCHEMA_JSON: &str = include_str!("../../../../schema/config-v1.json");

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

/// Loads the file (or defaults when `path` is `None`), then applies
/// environment overrides from the process environment.
pub fn load_effective_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// Applies `DATABASE_URL`, `IMAP_*` and `FETCH_*` overrides.
///
/// `lookup` abstracts the environment so tests need not mutate it.
/// `IMAP_PASSWORD` is never copied into the config; it becomes the
/// password env var so the value is read at connect time.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("DATABASE_URL") {
        config.database.url = Some(url);
    }

    if let Some(host) = get("IMAP_SERVER") {
        match config.mailbox.as_mut() {
            Some(mailbox) => mailbox.host = host,
            None => config.mailbox = Some(MailboxConfig::new(host, "")),
        }
    }

    let Some(mailbox) = config.mailbox.as_mut() else {
        return Ok(());
    };

    if let Some(port) = get("IMAP_PORT") {
        mailbox.port = parse_env("IMAP_PORT", &port)?;
    }
    if let Some(user) = get("IMAP_USER") {
        mailbox.username = user;
    }
    if get("IMAP_PASSWORD").is_some() {
        mailbox.password_env_var = Some("IMAP_PASSWORD".to_string());
    }
    if let Some(folder) = get("IMAP_FOLDER") {
        mailbox.folder = folder;
    }
    if let Some(interval) = get("FETCH_INTERVAL") {
        mailbox.poll_interval = parse_env("FETCH_INTERVAL", &interval)?;
    }
    if let Some(days) = get("FETCH_DAYS_LIMIT") {
        mailbox.since_days = Some(parse_env("FETCH_DAYS_LIMIT", &days)?);
    }

    debug!(host = %mailbox.host, folder = %mailbox.folder, "Applied environment overrides");
    Ok(())
}

fn parse_env<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnv {
            name,
            reason: e.to_string(),
        })
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if !LOG_LEVELS.contains(&config.logging.level.to_ascii_lowercase().as_str()) {
        return Err(ConfigError::Validation {
            message: format!("Unknown log level: {}", config.logging.level),
        });
    }

    if config.import.workers == 0 {
        return Err(ConfigError::Validation {
            message: "import.workers must be at least 1".to_string(),
        });
    }

    if let Some(mailbox) = &config.mailbox {
        validate_mailbox(mailbox)?;
    }

    Ok(())
}

fn validate_mailbox(mailbox: &MailboxConfig) -> Result<(), ConfigError> {
    let fail = |message: &str| {
        Err(ConfigError::Validation {
            message: format!("mailbox: {}", message),
        })
    };

    if mailbox.host.trim().is_empty() {
        return fail("host must not be empty");
    }
    if mailbox.username.trim().is_empty() {
        return fail("username must not be empty");
    }
    if !mailbox.use_tls {
        return fail("plain-text IMAP is not supported; set useTls to true");
    }
    if !has_secret_source(
        mailbox.password.as_deref(),
        mailbox.password_file.as_deref(),
        mailbox.password_env_var.as_deref(),
    ) {
        return fail("one of password, passwordFile or passwordEnvVar is required");
    }
    if mailbox.poll_interval == 0 {
        return fail("pollInterval must be at least 1 second");
    }
    if mailbox.batch_size == 0 {
        return fail("batchSize must be at least 1");
    }
    if mailbox.connect_timeout_secs == 0 {
        return fail("connectTimeoutSecs must be at least 1");
    }

    Ok(())
}
