//! # feedscanctl
//!
//! Operator CLI for the feedscan pipeline: applies migrations, runs queue
//! workers, and starts, inspects and requeues catalog scans against the
//! Postgres backend.

mod commands;
mod config;

use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use feedscan_model::{ScanId, ScanType};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{ConfigSource, FeedscanConfig};

/// CLI entry point
#[derive(Parser, Debug)]
#[command(name = "feedscanctl")]
#[command(about = "Run and inspect resumable catalog scans")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply database migrations and exit
    Migrate,
    /// Consume the work queue until interrupted
    Worker {
        /// Concurrent queue consumers (overrides config)
        #[arg(long, env = "FEEDSCAN_PARALLELISM")]
        parallelism: Option<usize>,
    },
    /// Start a scan
    Start(StartArgs),
    /// Show a scan's state and pending work
    Status(ScanRef),
    /// Re-send every pending message of a stuck scan
    Requeue(ScanRef),
    /// List the newest scans of a cursor
    Scans {
        /// Cursor to list; ad-hoc scans when omitted
        #[arg(long, default_value = "")]
        cursor: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show approximate work and poison queue depths
    Queues,
}

#[derive(ClapArgs, Debug, Clone)]
struct StartArgs {
    #[arg(long, value_parser = parse_scan_type)]
    scan_type: ScanType,

    /// Cursor the scan resumes from; omit for an ad-hoc scan
    #[arg(long, conflicts_with = "default_cursor")]
    cursor: Option<String>,

    /// Use the scan type's default cursor
    #[arg(long, default_value_t = false)]
    default_cursor: bool,

    /// Exclusive lower bound (RFC 3339)
    #[arg(long)]
    min: Option<DateTime<Utc>>,

    /// Inclusive upper bound (RFC 3339); defaults to the feed's commit
    #[arg(long)]
    max: Option<DateTime<Utc>>,

    /// Poll until the scan completes, then advance its cursor
    #[arg(long, default_value_t = false)]
    wait: bool,

    /// Delay between status polls with --wait
    #[arg(long, default_value = "5s")]
    poll: humantime::Duration,
}

impl StartArgs {
    fn cursor_name(&self) -> Option<String> {
        if self.default_cursor {
            Some(self.scan_type.default_cursor_name())
        } else {
            self.cursor.clone().filter(|c| !c.is_empty())
        }
    }

    fn poll_interval(&self) -> Duration {
        (*self.poll).max(Duration::from_millis(100))
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct ScanRef {
    #[arg(long)]
    scan_id: ScanId,

    /// Cursor the scan belongs to; empty for ad-hoc scans
    #[arg(long, default_value = "")]
    cursor: String,
}

fn parse_scan_type(raw: &str) -> Result<ScanType, String> {
    raw.parse::<ScanType>().map_err(|err| err.to_string())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,feedscan_core=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> anyhow::Result<FeedscanConfig> {
    let env_file_loaded = dotenvy::dotenv().is_ok();
    let (config, source) = FeedscanConfig::load_from_env()?;

    if env_file_loaded {
        info!("loaded .env file");
    }
    match &source {
        ConfigSource::Default => info!("no config file found, using defaults"),
        ConfigSource::EnvPath(path) => {
            info!(path = %path.display(), "config loaded from env path")
        }
        ConfigSource::EnvInline => info!("config loaded from inline environment json"),
        ConfigSource::File(path) => info!(path = %path.display(), "config loaded from file"),
    }
    if config.database_url.is_none() {
        warn!("DATABASE_URL is not set");
    }
    info!(
        feed.index_url = %config.pipeline.feed.index_url,
        queue.bulk_enqueue_threshold = config.pipeline.queue.bulk_enqueue_threshold,
        queue.max_dequeue_count = config.pipeline.queue.max_dequeue_count,
        worker.parallelism = config.pipeline.worker.parallelism,
        "configuration in effect"
    );
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let mut config = load_config()?;

    match cli.command {
        Command::Migrate => commands::migrate(&config).await,
        Command::Worker { parallelism } => {
            if let Some(parallelism) = parallelism {
                config.pipeline.worker.parallelism = parallelism.max(1);
            }
            commands::worker(&config).await
        }
        Command::Start(args) => commands::start(&config, &args).await,
        Command::Status(scan) => commands::status(&config, &scan).await,
        Command::Requeue(scan) => commands::requeue(&config, &scan).await,
        Command::Scans { cursor, limit } => commands::scans(&config, &cursor, limit).await,
        Command::Queues => commands::queues(&config).await,
    }
}
