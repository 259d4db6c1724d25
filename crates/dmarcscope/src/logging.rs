//! Tracing subscriber setup.
//!
//! Library code only emits `tracing` events; the binary calls [`init_logging`]
//! once at startup. `RUST_LOG` takes precedence over the configured level, and
//! `log` records from dependencies (rusqlite, async-imap) are bridged into the
//! same subscriber.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

/// Builds the filter: `RUST_LOG` if set, otherwise `level` for this crate and
/// `warn` for everything else.
fn build_filter(level: &str) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(format!("warn,dmarcscope={}", level))
        .with_context(|| format!("Invalid log level '{}'", level))
}

/// Installs the global subscriber. Logs go to stderr so JSON query output on
/// stdout stays clean.
pub fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    tracing_log::LogTracer::init().context("Failed to bridge log records")?;

    let filter = build_filter(level)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Text => tracing::subscriber::set_global_default(
            registry.with(fmt::layer().with_writer(std::io::stderr).with_target(true)),
        ),
        LogFormat::Json => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_current_span(true),
            ),
        ),
    };
    installed.context("Failed to install tracing subscriber")?;

    Ok(())
}
