//! dmarcscope command-line interface.
//!
//! Query commands print JSON to stdout; logs go to stderr.

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use dmarcscope::analytics::{self, Scope, TimelineQuery};
use dmarcscope::db::report_repo::{self, ReportFilter};
use dmarcscope::db::{ledger, stats_repo};
use dmarcscope::error::ConfigError;
use dmarcscope::ingest::import_files;
use dmarcscope::{
    init_logging, load_effective_config, Config, Database, Ingestor, LocalSource, MailboxPoller,
    MailboxSource,
};

#[derive(Parser)]
#[command(name = "dmarcscope")]
#[command(about = "Ingest DMARC aggregate reports and analyze them", version)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, env = "DMARCSCOPE_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import report files or directories, then exit
    Import {
        /// Files or directories; defaults to `import.directory`
        paths: Vec<PathBuf>,
    },
    /// Poll the configured mailbox until interrupted
    Poll {
        /// Run a single cycle and exit
        #[arg(long)]
        once: bool,
    },
    /// Detect misconfigurations
    Issues,
    /// Authentication health of one sending IP, or of all by volume
    Health {
        ip: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Daily message volumes
    Timeline {
        #[arg(long, default_value_t = 30)]
        days: u32,
        #[arg(long, conflicts_with = "source")]
        domain: Option<String>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Per-domain aggregates
    Domains,
    /// Store-wide totals
    Overview,
    /// List stored reports, newest first
    Reports {
        #[arg(long)]
        search: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// One report with its records
    Report { report_id: String },
    /// Documents that failed ingestion
    Failures {
        #[arg(long, default_value_t = 50)]
        limit: u32,
    },
    /// Delete reports whose period ended before a date (YYYY-MM-DD)
    Purge {
        #[arg(long)]
        before: NaiveDate,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_effective_config(cli.config.as_deref()).context("Failed to load config")?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    init_logging(level, config.logging.format)?;

    let location = config
        .database
        .location()
        .context("No database URL configured and no home directory found")?;
    let db = Database::open_location(&location).context("Failed to open database")?;

    match cli.command {
        Command::Import { paths } => import(&config, db, paths),
        Command::Poll { once } => poll(&config, db, once),
        Command::Issues => print_json(&analytics::detect_issues(
            &db,
            &config.analytics,
            Utc::now(),
        )?),
        Command::Health { ip: Some(ip), .. } => match analytics::source_health(&db, &ip)? {
            Some(health) => print_json(&health),
            None => bail!("No reports mention source {}", ip),
        },
        Command::Health { ip: None, limit } => {
            print_json(&analytics::source_health_list(&db, limit)?)
        }
        Command::Timeline {
            days,
            domain,
            source,
        } => {
            let mut query = TimelineQuery::new(days);
            query.scope = domain.map(Scope::Domain).or(source.map(Scope::Source));
            print_json(&analytics::timeline(&db, &query)?)
        }
        Command::Domains => print_json(&analytics::domain_aggregates(&db)?),
        Command::Overview => print_json(&stats_repo::overview(&db)?),
        Command::Reports {
            search,
            domain,
            limit,
            offset,
        } => {
            let filter = ReportFilter {
                search,
                domain,
                limit: Some(limit),
                offset: Some(offset),
                ..ReportFilter::default()
            };
            print_json(&report_repo::list(&db, &filter)?)
        }
        Command::Report { report_id } => match report_repo::detail(&db, &report_id)? {
            Some(detail) => print_json(&detail),
            None => bail!("Report {} not found", report_id),
        },
        Command::Failures { limit } => print_json(&ledger::list_failures(&db, limit)?),
        Command::Purge { before } => {
            let cutoff = before
                .and_hms_opt(0, 0, 0)
                .context("Invalid purge date")?
                .and_utc();
            let deleted = report_repo::delete_before(&db, cutoff)?;
            info!(deleted, before = %before, "Purged reports");
            print_json(&serde_json::json!({ "deleted": deleted }))
        }
    }
}

fn import(config: &Config, db: Database, mut paths: Vec<PathBuf>) -> Result<()> {
    if paths.is_empty() {
        match &config.import.directory {
            Some(dir) => paths.push(PathBuf::from(dir)),
            None => bail!("No paths given and import.directory is not configured"),
        }
    }

    let files = LocalSource::new(config.import.recursive).collect(&paths)?;
    let summary = import_files(&Ingestor::new(db), files, config.import.workers)?;
    print_json(&summary)
}

fn poll(config: &Config, db: Database, once: bool) -> Result<()> {
    let mailbox = config
        .mailbox
        .clone()
        .ok_or(ConfigError::MailboxMissing)
        .context("Set `mailbox` in the config file or IMAP_SERVER")?;
    let source = MailboxSource::new(mailbox, db.clone());
    let poller = MailboxPoller::new(source, Ingestor::new(db));

    if once {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let stats = rt.block_on(poller.run_once())?;
        return print_json(&stats);
    }

    let (stop_tx, stop_rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let handle = poller.start();
    info!("Polling mailbox; press Ctrl-C to stop");

    if stop_rx.recv().is_err() {
        warn!("Signal channel closed");
    }
    info!("Stopping after the current cycle...");
    poller.stop();
    if handle.join().is_err() {
        bail!("Poller thread panicked");
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let stdout = std::io::stdout();
    serde_json::to_writer_pretty(stdout.lock(), value)?;
    println!();
    Ok(())
}
