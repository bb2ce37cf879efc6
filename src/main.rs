//! # Crawl Collector CLI (`ccc`)
//!
//! The `ccc` binary drives a collection: it discovers crawl snapshots,
//! searches their indexes for the configured domains, and downloads every
//! matching record, resuming wherever the previous run stopped.
//!
//! ## Usage
//!
//! ```bash
//! ccc --config ./collector.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ccc run` | Collect records until stopped (or for `--cycles N`) |
//! | `ccc search <domain>` | Print the index records of a domain in one archive |
//! | `ccc retry` | Drain the retry ledger |
//! | `ccc archives` | Refresh and list the archive catalog |
//! | `ccc status [domain]` | Report progress from local state |
//!
//! Logs go to stderr at `[logging] level`; milestone notifications go to
//! stderr as configured by `[logging] notify`. Stdout only carries command
//! output.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use crawl_collector::collect::Collector;
use crawl_collector::config::{self, Config};
use crawl_collector::domain::DomainKey;
use crawl_collector::fetch::HttpTransport;
use crawl_collector::ledger::RetryOutcome;
use crawl_collector::notify::{format_number, NotifyMode};
use crawl_collector::pacer::SystemClock;
use crawl_collector::status;

/// Crawl Collector CLI: resumable collection of domain captures from
/// Common Crawl.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. Every section is optional.
#[derive(Parser)]
#[command(
    name = "ccc",
    about = "Crawl Collector: resumable collection of domain captures from Common Crawl",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./collector.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collector.
    ///
    /// Each cycle downloads at most one new record and retries at most one
    /// failed download. Sleeps `[collector] idle_secs` when there is nothing
    /// to do.
    Run {
        /// Stop after this many cycles.
        #[arg(long)]
        cycles: Option<u64>,
    },

    /// Search one domain in one archive and print the matching records.
    ///
    /// Prints one JSON record per line and records the result count in the
    /// domain's progress.
    Search {
        /// Domain to search for; subdomains are included.
        domain: String,

        /// Archive ID (e.g. `CC-MAIN-2024-10`). Defaults to the newest.
        #[arg(long)]
        archive: Option<String>,
    },

    /// Retry failed downloads from the retry ledger.
    Retry {
        /// Maximum number of entries to attempt (default: every entry once).
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Refresh the archive catalog and list it.
    Archives,

    /// Report collection progress.
    ///
    /// Without a domain, prints totals for every configured domain.
    Status {
        /// Domain to report on.
        domain: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_max_level(cfg.logging.tracing_level()?)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Status { domain } => {
            status::run_status(&cfg, domain.as_deref())?;
        }
        Commands::Run { cycles } => {
            let mut collector = build_collector(&cfg)?;
            let done = collector.run(cycles).await?;
            tracing::info!(cycles = done, "collector stopped");
        }
        Commands::Search { domain, archive } => {
            let key = DomainKey::new(&domain)?;
            let mut collector = build_collector(&cfg)?;
            collector
                .refresh_catalog()
                .await
                .context("Failed to refresh archive catalog")?;
            let archive_id = match archive {
                Some(id) => id,
                None => match collector.catalog().archives().first() {
                    Some(newest) => newest.archive_id.clone(),
                    None => bail!("The archive catalog is empty."),
                },
            };
            let records = collector.search_domain(&key, &archive_id).await?;
            for record in &records {
                println!("{}", record);
            }
            eprintln!(
                "{} records for {} in {}",
                format_number(records.len() as u64),
                key,
                archive_id
            );
        }
        Commands::Retry { limit } => {
            let mut collector = build_collector(&cfg)?;
            let attempts = limit.unwrap_or(collector.ledger().len());
            let (mut recovered, mut requeued, mut refused, mut dropped) = (0u64, 0u64, 0u64, 0u64);
            for _ in 0..attempts {
                match collector.retry_one().await? {
                    RetryOutcome::Empty => break,
                    RetryOutcome::Recovered(_) => recovered += 1,
                    RetryOutcome::Requeued(_) => requeued += 1,
                    RetryOutcome::Abandoned(_) => refused += 1,
                    RetryOutcome::Dropped(_) => dropped += 1,
                }
            }
            println!(
                "Retried: {} recovered, {} failed again, {} refused, {} dropped. {} left in the ledger.",
                recovered,
                requeued,
                refused,
                dropped,
                collector.ledger().len()
            );
        }
        Commands::Archives => {
            let mut collector = build_collector(&cfg)?;
            collector
                .refresh_catalog()
                .await
                .context("Failed to refresh archive catalog")?;
            let catalog = collector.catalog();
            println!("{:<20} {}", "ARCHIVE", "INDEX PATHS");
            for archive in catalog.archives() {
                println!("{:<20} {}", archive.archive_id, archive.index_paths);
            }
            println!();
            println!("{} archives", catalog.len());
        }
    }

    Ok(())
}

fn build_collector(cfg: &Config) -> Result<Collector> {
    let domains = config::load_domains(&cfg.paths.domains)?;
    let transport = Arc::new(HttpTransport::new(&cfg.fetch)?);
    let notify = NotifyMode::from_setting(&cfg.logging.notify).unwrap_or(NotifyMode::Off);
    let collector = Collector::new(
        cfg.clone(),
        domains,
        transport,
        Arc::new(SystemClock::new()),
        notify.notifier(),
    )?;
    Ok(collector)
}
