//! Resumable per-(domain, archive) progress.
//!
//! Each configured domain has one JSON document under the history directory,
//! keyed by archive ID:
//!
//! ```json
//! {"CC-MAIN-2024-10": {"completed": 12, "failed": 1, "results": 40}}
//! ```
//!
//! Every mutation is written through immediately. There is no batching, so a
//! crash loses at most the update that was in flight and the affected record
//! is fetched again on resume (at-least-once).
//!
//! A pair is done when the search found nothing (`results == 0`), or when
//! every result has been fetched and nothing is waiting in the retry ledger
//! (`completed == results && failed == 0`).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::domain::DomainKey;
use crate::error::CollectorResult;
use crate::storage::write_atomic;

/// Counters for one domain in one archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProgress {
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
    /// Number of matching records; unknown until the archive is searched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<u64>,
}

impl DomainProgress {
    pub fn is_done(&self) -> bool {
        match self.results {
            Some(0) => true,
            Some(results) => self.completed == results && self.failed == 0,
            None => false,
        }
    }

    /// Index of the next record to fetch. Records before it were either
    /// fetched or handed to the retry ledger.
    pub fn cursor(&self) -> u64 {
        self.completed + self.failed
    }

    /// Whether a fetch step has anything to do for this pair.
    pub fn has_pending_work(&self) -> bool {
        !self.is_done() && self.results.map_or(true, |results| self.cursor() < results)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressField {
    Completed,
    Failed,
    Results,
}

type History = BTreeMap<String, DomainProgress>;

/// Owner of all [`DomainProgress`] records.
pub struct ProgressStore {
    dir: PathBuf,
    configured: HashSet<String>,
    loaded: HashMap<String, History>,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>, domains: &[DomainKey]) -> Self {
        Self {
            dir: dir.into(),
            configured: domains.iter().map(|d| d.domain().to_string()).collect(),
            loaded: HashMap::new(),
        }
    }

    /// Whether `domain` is still part of the configured domain list.
    pub fn is_configured(&self, domain: &str) -> bool {
        self.configured.contains(domain)
    }

    fn document_path(&self, domain: &str) -> PathBuf {
        self.dir.join(domain)
    }

    /// Progress of every archive for `domain`, read from disk on first use.
    ///
    /// A missing or unreadable document is a fresh start, never an error.
    pub fn load(&mut self, domain: &str) -> &History {
        self.history_mut(domain)
    }

    fn history_mut(&mut self, domain: &str) -> &mut History {
        let path = self.document_path(domain);
        self.loaded
            .entry(domain.to_string())
            .or_insert_with(|| read_history(&path))
    }

    pub fn get(&mut self, domain: &str, archive_id: &str) -> DomainProgress {
        self.load(domain)
            .get(archive_id)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_done(&mut self, domain: &str, archive_id: &str) -> bool {
        self.get(domain, archive_id).is_done()
    }

    /// Set one counter and persist the domain's document.
    pub fn record_result(
        &mut self,
        domain: &str,
        archive_id: &str,
        field: ProgressField,
        value: u64,
    ) -> CollectorResult<()> {
        self.update(domain, archive_id, |progress| match field {
            ProgressField::Completed => progress.completed = value,
            ProgressField::Failed => progress.failed = value,
            ProgressField::Results => progress.results = Some(value),
        })
    }

    /// Add `delta` to a counter (saturating at zero), persist, and return the
    /// new value.
    pub fn adjust(
        &mut self,
        domain: &str,
        archive_id: &str,
        field: ProgressField,
        delta: i64,
    ) -> CollectorResult<u64> {
        let current = self.get(domain, archive_id);
        let old = match field {
            ProgressField::Completed => current.completed,
            ProgressField::Failed => current.failed,
            ProgressField::Results => current.results.unwrap_or(0),
        };
        let new = old.saturating_add_signed(delta);
        self.record_result(domain, archive_id, field, new)?;
        Ok(new)
    }

    /// Move one record from `failed` to `completed` in a single write, so
    /// the cursor never moves. Returns `false` without writing when the pair
    /// has no failures left to move.
    pub fn recover(&mut self, domain: &str, archive_id: &str) -> CollectorResult<bool> {
        if self.get(domain, archive_id).failed == 0 {
            return Ok(false);
        }
        self.update(domain, archive_id, |progress| {
            progress.failed -= 1;
            progress.completed += 1;
        })?;
        Ok(true)
    }

    fn update(
        &mut self,
        domain: &str,
        archive_id: &str,
        apply: impl FnOnce(&mut DomainProgress),
    ) -> CollectorResult<()> {
        let path = self.document_path(domain);
        let history = self.history_mut(domain);
        apply(history.entry(archive_id.to_string()).or_default());
        write_atomic(&path, &serde_json::to_vec(&*history)?)?;
        Ok(())
    }
}

fn read_history(path: &Path) -> History {
    let Ok(content) = std::fs::read_to_string(path) else {
        return History::new();
    };
    match serde_json::from_str(&content) {
        Ok(history) => {
            tracing::debug!(path = %path.display(), "loaded search history");
            history
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "malformed history, starting over");
            History::new()
        }
    }
}
