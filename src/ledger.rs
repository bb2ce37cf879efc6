//! Durable FIFO of failed record downloads.
//!
//! When a record download fails transiently it is appended here and the
//! domain's `failed` counter goes up. The collector drains at most one entry
//! per cycle, so retries run at the same cadence as fresh work instead of
//! hammering a struggling host.
//!
//! An entry leaves the file only once its retry has an outcome. The record
//! keeps counting as `failed` until then, so a crash mid-retry leaves both
//! the entry and the pair's cursor where they were.
//!
//! The ledger file holds one entry per line, tab-separated:
//!
//! ```text
//! url  localPath  offset  length  domainKey  archiveID  attempts
//! ```
//!
//! Missing offset/length are written as empty fields. The whole file is
//! rewritten after every mutation.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use crate::domain::DomainKey;
use crate::error::{CollectorError, CollectorResult};
use crate::fetch::{FetchClient, FetchResource};
use crate::notify::{Milestone, Notifier};
use crate::progress::{ProgressField, ProgressStore};
use crate::storage::write_atomic;

/// One failed download waiting for another attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEntry {
    pub url: String,
    pub local_path: PathBuf,
    pub offset: Option<u64>,
    pub length: Option<u64>,
    pub domain: DomainKey,
    pub archive_id: String,
    pub attempts: u32,
}

impl RetryEntry {
    /// Build an entry for a failed download. Resources without an output
    /// path or owning domain cannot be retried through the ledger.
    pub fn from_resource(resource: &FetchResource) -> Option<Self> {
        Some(Self {
            url: resource.url.clone(),
            local_path: resource.local_path.clone()?,
            offset: resource.range.map(|r| r.offset),
            length: resource.range.map(|r| r.length),
            domain: resource.domain.clone()?,
            archive_id: resource.archive_id.clone()?,
            attempts: 1,
        })
    }

    pub fn to_resource(&self) -> FetchResource {
        FetchResource::new(self.url.clone())
            .cached_at(self.local_path.clone())
            .with_range(self.offset, self.length)
            .for_domain(self.domain.clone(), self.archive_id.clone())
    }

    fn to_line(&self) -> String {
        let opt = |v: Option<u64>| v.map(|n| n.to_string()).unwrap_or_default();
        [
            self.url.clone(),
            self.local_path.display().to_string(),
            opt(self.offset),
            opt(self.length),
            self.domain.search_key().to_string(),
            self.archive_id.clone(),
            self.attempts.to_string(),
        ]
        .join("\t")
    }

    fn parse(line: &str) -> CollectorResult<Self> {
        let malformed = |why: &str| CollectorError::parsing(format!("retry ledger line {line:?}: {why}"));

        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            return Err(malformed("expected 7 tab-separated fields"));
        }
        let opt = |s: &str| -> CollectorResult<Option<u64>> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some).map_err(|_| malformed("bad number"))
            }
        };

        Ok(Self {
            url: fields[0].to_string(),
            local_path: PathBuf::from(fields[1]),
            offset: opt(fields[2])?,
            length: opt(fields[3])?,
            domain: DomainKey::from_search_key(fields[4])?,
            archive_id: fields[5].to_string(),
            attempts: fields[6].parse().map_err(|_| malformed("bad attempt count"))?,
        })
    }
}

/// What [`RetryLedger::retry_one`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome {
    Empty,
    Recovered(RetryEntry),
    Requeued(RetryEntry),
    /// The entry's domain is no longer configured.
    Dropped(RetryEntry),
    /// The host refused the record outright (4xx or an unreadable reply).
    /// The entry is taken off the ledger and the record stays `failed`.
    Abandoned(RetryEntry),
}

pub struct RetryLedger {
    path: PathBuf,
    queue: VecDeque<RetryEntry>,
}

impl RetryLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            queue: VecDeque::new(),
        }
    }

    /// Restore the ledger from `path`. A missing file is an empty ledger;
    /// unreadable lines are skipped with a warning.
    pub fn load_from_disk(path: impl Into<PathBuf>) -> CollectorResult<Self> {
        let mut ledger = Self::new(path);
        let content = match std::fs::read_to_string(&ledger.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ledger),
            Err(e) => return Err(e.into()),
        };

        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            match RetryEntry::parse(line) {
                Ok(entry) => ledger.queue.push_back(entry),
                Err(e) => tracing::warn!(error = %e, "skipping retry ledger entry"),
            }
        }
        tracing::info!(entries = ledger.queue.len(), "loaded retry ledger");
        Ok(ledger)
    }

    pub fn persist(&self) -> CollectorResult<()> {
        let mut out = String::new();
        for entry in &self.queue {
            out.push_str(&entry.to_line());
            out.push('\n');
        }
        write_atomic(&self.path, out.as_bytes())?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &RetryEntry> {
        self.queue.iter()
    }

    /// Record a failed download. Returns `false` when the entry was dropped
    /// because its domain is no longer configured.
    pub fn enqueue(
        &mut self,
        resource: &FetchResource,
        progress: &mut ProgressStore,
    ) -> CollectorResult<bool> {
        let Some(entry) = RetryEntry::from_resource(resource) else {
            tracing::warn!(url = %resource.url, "resource cannot be retried, not enqueued");
            return Ok(false);
        };
        self.push(entry, progress)
    }

    fn push(&mut self, entry: RetryEntry, progress: &mut ProgressStore) -> CollectorResult<bool> {
        let domain = entry.domain.domain().to_string();
        if !progress.is_configured(&domain) {
            tracing::warn!(%domain, url = %entry.url, "domain no longer configured, dropping retry");
            return Ok(false);
        }
        let archive_id = entry.archive_id.clone();
        self.queue.push_back(entry);
        self.persist()?;
        progress.adjust(&domain, &archive_id, ProgressField::Failed, 1)?;
        Ok(true)
    }

    /// Try the oldest entry once more.
    ///
    /// Success moves the record from `failed` to `completed` in one progress
    /// write and only then removes the entry. A transient failure sends the
    /// entry to the tail with one more attempt; a refusal from the host
    /// abandons it. Local errors leave the ledger untouched.
    pub async fn retry_one(
        &mut self,
        fetch: &FetchClient,
        progress: &mut ProgressStore,
        notifier: &dyn Notifier,
    ) -> CollectorResult<RetryOutcome> {
        let Some(mut entry) = self.queue.front().cloned() else {
            return Ok(RetryOutcome::Empty);
        };

        let domain = entry.domain.domain().to_string();
        if !progress.is_configured(&domain) {
            tracing::warn!(%domain, url = %entry.url, "domain no longer configured, dropping retry");
            self.queue.pop_front();
            self.persist()?;
            return Ok(RetryOutcome::Dropped(entry));
        }

        match fetch.fetch_to_file(&entry.to_resource()).await {
            Ok(_) => {
                // Nothing to move means a crash hit between this write and
                // the ledger's on an earlier run.
                if !progress.recover(&domain, &entry.archive_id)? {
                    tracing::warn!(url = %entry.url, "retried record was already counted");
                }
                self.queue.pop_front();
                self.persist()?;
                tracing::info!(url = %entry.url, attempts = entry.attempts, "retry succeeded");
                if self.queue.is_empty() {
                    notifier.notify(Milestone::BacklogCleared);
                }
                Ok(RetryOutcome::Recovered(entry))
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(url = %entry.url, attempts = entry.attempts, error = %e, "retry failed");
                entry.attempts += 1;
                self.queue.pop_front();
                self.queue.push_back(entry.clone());
                self.persist()?;
                Ok(RetryOutcome::Requeued(entry))
            }
            Err(e) if e.is_fatal_for_archive() => {
                tracing::error!(
                    url = %entry.url,
                    path = %entry.local_path.display(),
                    attempts = entry.attempts,
                    error = %e,
                    "retry refused, removing from ledger"
                );
                self.queue.pop_front();
                self.persist()?;
                Ok(RetryOutcome::Abandoned(entry))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(n: u64, attempts: u32) -> RetryEntry {
        RetryEntry {
            url: format!("https://data.commoncrawl.org/crawl-data/x/{n}.warc.gz"),
            local_path: PathBuf::from(format!("collection/{n}-10-20.warc.gz")),
            offset: Some(10 * n),
            length: Some(20),
            domain: DomainKey::new("example.com").unwrap(),
            archive_id: "CC-MAIN-2024-10".to_string(),
            attempts,
        }
    }

    #[test]
    fn test_persist_then_load_round_trips() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("retryqueue");
        let mut ledger = RetryLedger::new(&path);
        ledger.queue.push_back(entry(1, 1));
        ledger.queue.push_back(entry(2, 5));
        let mut unranged = entry(3, 2);
        unranged.offset = None;
        unranged.length = None;
        ledger.queue.push_back(unranged);
        ledger.persist().unwrap();

        let restored = RetryLedger::load_from_disk(&path).unwrap();
        let a: Vec<_> = ledger.entries().cloned().collect();
        let b: Vec<_> = restored.entries().cloned().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_line_format() {
        let line = entry(1, 3).to_line();
        let fields: Vec<&str> = line.split('\t').collect();
        assert_eq!(fields.len(), 7);
        assert_eq!(fields[2], "10");
        assert_eq!(fields[4], "com,example");
        assert_eq!(fields[6], "3");
    }

    #[test]
    fn test_load_skips_bad_lines_and_missing_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("retryqueue");
        assert!(RetryLedger::load_from_disk(&path).unwrap().is_empty());

        let good = entry(1, 1).to_line();
        std::fs::write(&path, format!("garbage line\n{good}\n\n")).unwrap();
        let ledger = RetryLedger::load_from_disk(&path).unwrap();
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_enqueue_counts_failures_and_drops_unconfigured() {
        let tmp = TempDir::new().unwrap();
        let domains = vec![DomainKey::new("example.com").unwrap()];
        let mut progress = ProgressStore::new(tmp.path().join("history"), &domains);
        let mut ledger = RetryLedger::new(tmp.path().join("retryqueue"));

        let resource = entry(1, 1).to_resource();
        assert!(ledger.enqueue(&resource, &mut progress).unwrap());
        assert_eq!(progress.get("example.com", "CC-MAIN-2024-10").failed, 1);
        assert_eq!(RetryLedger::load_from_disk(ledger.path()).unwrap().len(), 1);

        let stranger = FetchResource::new("https://h/x")
            .cached_at(tmp.path().join("x"))
            .with_range(Some(0), Some(1))
            .for_domain(DomainKey::new("other.org").unwrap(), "CC-MAIN-2024-10");
        assert!(!ledger.enqueue(&stranger, &mut progress).unwrap());
        assert_eq!(ledger.len(), 1);

        let no_path = FetchResource::new("https://h/y");
        assert!(!ledger.enqueue(&no_path, &mut progress).unwrap());
    }
}
