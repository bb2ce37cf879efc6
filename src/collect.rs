//! The collection driver.
//!
//! Each cycle does a bounded amount of work so that a run can be stopped at
//! any moment and resumed later:
//!
//! 1. refresh the archive catalog (at most once per refresh window);
//! 2. pick the first (domain, archive) pair with work left, in configured
//!    domain order × catalog order;
//! 3. search it if this session has not already done so, then download the
//!    record at the pair's cursor;
//! 4. give one retry-ledger entry another attempt.
//!
//! Pairs whose index cannot be parsed, or whose requests come back with a
//! 4xx status, are parked for the rest of the run instead of being hit again
//! every cycle.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::ArchiveCatalog;
use crate::cdx::CdxRecord;
use crate::config::Config;
use crate::domain::DomainKey;
use crate::error::{CollectorError, CollectorResult};
use crate::fetch::{FetchClient, FetchResource, Transport};
use crate::ledger::{RetryLedger, RetryOutcome};
use crate::notify::{Milestone, Notifier};
use crate::pacer::{Clock, PacerSettings, RequestPacer};
use crate::progress::{ProgressField, ProgressStore};
use crate::search::IndexSearch;

/// What the fetch step of a cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Fetched {
        domain: String,
        archive_id: String,
        path: PathBuf,
    },
    /// The search found no records; the pair is done.
    NoResults { domain: String, archive_id: String },
    /// A transient failure. Record downloads went to the retry ledger.
    Deferred {
        domain: String,
        archive_id: String,
        reason: String,
    },
    Quarantined {
        domain: String,
        archive_id: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// `None` when no pair had work left.
    pub step: Option<StepOutcome>,
    pub retry: RetryOutcome,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.step.is_none() && self.retry == RetryOutcome::Empty
    }
}

/// Search results of the pair currently being worked on.
struct SearchSession {
    domain: String,
    archive_id: String,
    records: Vec<String>,
}

pub struct Collector {
    config: Config,
    domains: Vec<DomainKey>,
    clock: Arc<dyn Clock>,
    fetch: FetchClient,
    catalog: ArchiveCatalog,
    search: IndexSearch,
    progress: ProgressStore,
    ledger: RetryLedger,
    notifier: Box<dyn Notifier>,
    quarantined: HashSet<(String, String)>,
    session: Option<SearchSession>,
}

impl Collector {
    /// Wire the collector together and restore persisted state (catalog,
    /// retry ledger; progress documents load lazily).
    pub fn new(
        config: Config,
        domains: Vec<DomainKey>,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
        notifier: Box<dyn Notifier>,
    ) -> CollectorResult<Self> {
        let pacer = RequestPacer::new(PacerSettings::from(&config.fetch), clock.clone());
        let fetch = FetchClient::new(transport, pacer);
        let catalog = ArchiveCatalog::load(config.paths.catalog_file());
        let search = IndexSearch::new(&config.paths.cache_dir, config.index.cache_shard_blocks);
        let progress = ProgressStore::new(&config.paths.history_dir, &domains);
        let ledger = RetryLedger::load_from_disk(&config.paths.retry_file)?;

        Ok(Self {
            config,
            domains,
            clock,
            fetch,
            catalog,
            search,
            progress,
            ledger,
            notifier,
            quarantined: HashSet::new(),
            session: None,
        })
    }

    pub fn domains(&self) -> &[DomainKey] {
        &self.domains
    }

    pub fn catalog(&self) -> &ArchiveCatalog {
        &self.catalog
    }

    pub fn progress_mut(&mut self) -> &mut ProgressStore {
        &mut self.progress
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub fn fetch(&self) -> &FetchClient {
        &self.fetch
    }

    pub fn is_quarantined(&self, domain: &str, archive_id: &str) -> bool {
        self.quarantined
            .contains(&(domain.to_string(), archive_id.to_string()))
    }

    pub async fn refresh_catalog(&mut self) -> CollectorResult<Vec<String>> {
        self.catalog
            .refresh(&self.fetch, &self.config.archive, self.notifier.as_ref())
            .await
    }

    /// Run cycles until `max_cycles` (forever when `None`). When a cycle
    /// finds nothing to do, sleep `collector.idle_secs` before the next.
    pub async fn run(&mut self, max_cycles: Option<u64>) -> CollectorResult<u64> {
        let mut cycles = 0;
        while max_cycles.map_or(true, |max| cycles < max) {
            let report = self.run_cycle().await?;
            cycles += 1;
            let more = max_cycles.map_or(true, |max| cycles < max);
            if report.is_idle() && more {
                let idle = Duration::from_secs(self.config.collector.idle_secs);
                tracing::info!(?idle, "nothing to do, waiting");
                self.clock.sleep(idle).await;
            }
        }
        Ok(cycles)
    }

    pub async fn run_cycle(&mut self) -> CollectorResult<CycleReport> {
        if let Err(e) = self.refresh_catalog().await {
            tracing::warn!(error = %e, "could not refresh archive catalog");
        }
        let step = self.step().await?;
        let retry = self.retry_one().await?;
        Ok(CycleReport { step, retry })
    }

    /// Give the oldest retry-ledger entry another attempt.
    pub async fn retry_one(&mut self) -> CollectorResult<RetryOutcome> {
        let outcome = self
            .ledger
            .retry_one(&self.fetch, &mut self.progress, self.notifier.as_ref())
            .await?;
        if let RetryOutcome::Recovered(entry) = &outcome {
            let domain = entry.domain.domain();
            if self.progress.is_done(domain, &entry.archive_id) {
                self.notify_completed(domain, &entry.archive_id);
            }
        }
        Ok(outcome)
    }

    /// Fetch a record to its local path. A transient failure is handed to
    /// the retry ledger before the error is returned.
    pub async fn download(&mut self, resource: &FetchResource) -> CollectorResult<PathBuf> {
        match self.fetch.fetch_to_file(resource).await {
            Ok(path) => Ok(path),
            Err(e) => {
                if e.is_retryable() {
                    self.ledger.enqueue(resource, &mut self.progress)?;
                }
                Err(e)
            }
        }
    }

    /// Search one domain in one archive and return the matching record
    /// payloads, updating the pair's `results`.
    pub async fn search_domain(
        &mut self,
        key: &DomainKey,
        archive_id: &str,
    ) -> CollectorResult<Vec<String>> {
        let archive = self.catalog.get_mut(archive_id).ok_or_else(|| {
            CollectorError::parsing(format!("archive {archive_id} is not in the catalog"))
        })?;
        self.search
            .search(&self.fetch, &mut self.progress, key, archive, &self.config.archive)
            .await
    }

    fn next_pair(&mut self) -> Option<(DomainKey, String)> {
        for key in &self.domains {
            for archive in self.catalog.archives() {
                let pair = (key.domain().to_string(), archive.archive_id.clone());
                if self.quarantined.contains(&pair) {
                    continue;
                }
                if self.progress.get(&pair.0, &pair.1).has_pending_work() {
                    return Some((key.clone(), pair.1));
                }
            }
        }
        None
    }

    async fn step(&mut self) -> CollectorResult<Option<StepOutcome>> {
        let Some((key, archive_id)) = self.next_pair() else {
            return Ok(None);
        };
        let domain = key.domain().to_string();

        match self.advance(&key, &archive_id).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) if e.is_fatal_for_archive() => {
                tracing::error!(%domain, archive = %archive_id, error = %e, "giving up on archive for this run");
                self.notifier.notify(Milestone::ArchiveFailed {
                    domain: domain.clone(),
                    archive_id: archive_id.clone(),
                    reason: e.to_string(),
                });
                self.quarantined.insert((domain.clone(), archive_id.clone()));
                self.session = None;
                Ok(Some(StepOutcome::Quarantined {
                    domain,
                    archive_id,
                    reason: e.to_string(),
                }))
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(%domain, archive = %archive_id, error = %e, "fetch failed");
                Ok(Some(StepOutcome::Deferred {
                    domain,
                    archive_id,
                    reason: e.to_string(),
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Search the pair if needed, then download the record at its cursor.
    async fn advance(&mut self, key: &DomainKey, archive_id: &str) -> CollectorResult<StepOutcome> {
        let domain = key.domain().to_string();
        let current = matches!(
            &self.session,
            Some(s) if s.domain == domain && s.archive_id == archive_id
        );
        if !current {
            self.session = None;
            let records = self.search_domain(key, archive_id).await?;
            self.session = Some(SearchSession {
                domain: domain.clone(),
                archive_id: archive_id.to_string(),
                records,
            });
        }

        let progress = self.progress.get(&domain, archive_id);
        if progress.results == Some(0) {
            tracing::info!(%domain, archive = %archive_id, "no records in archive");
            return Ok(StepOutcome::NoResults {
                domain,
                archive_id: archive_id.to_string(),
            });
        }

        let cursor = progress.cursor();
        let record = self
            .session
            .as_ref()
            .and_then(|s| s.records.get(cursor as usize))
            .ok_or_else(|| {
                CollectorError::parsing(format!(
                    "{domain} in {archive_id}: cursor {cursor} is past the search results"
                ))
            })?;
        let record = CdxRecord::from_json(record)?;

        let resource = FetchResource::new(self.config.archive.url_for(&record.filename))
            .cached_at(self.config.paths.collection_dir.join(record.artifact_name()))
            .with_range(Some(record.offset), Some(record.length))
            .for_domain(key.clone(), archive_id);
        let path = self.download(&resource).await?;

        self.progress
            .adjust(&domain, archive_id, ProgressField::Completed, 1)?;
        tracing::debug!(%domain, archive = %archive_id, path = %path.display(), "fetched record");
        if self.progress.is_done(&domain, archive_id) {
            self.notify_completed(&domain, archive_id);
        }

        Ok(StepOutcome::Fetched {
            domain,
            archive_id: archive_id.to_string(),
            path,
        })
    }

    fn notify_completed(&self, domain: &str, archive_id: &str) {
        tracing::info!(domain, archive = archive_id, "domain complete in archive");
        self.notifier.notify(Milestone::DomainCompleted {
            domain: domain.to_string(),
            archive_id: archive_id.to_string(),
        });
    }
}
