//! Discovery of crawl snapshots.
//!
//! The archive host publishes an HTML page listing every snapshot. Each
//! table row in its `<tbody>` carries three links: the snapshot ID, its query
//! endpoint (unused here), and its `cc-index.paths.gz` manifest.
//!
//! The page changes a few times a year, so it is fetched at most once per
//! `archive.catalog_refresh_hours`. The parsed list and the time of the last
//! refresh are kept in `<cache_dir>/archives.json` so the window survives
//! restarts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use quick_xml::events::{BytesStart, BytesText, Event};
use serde::{Deserialize, Serialize};

use crate::archive::Archive;
use crate::config::ArchiveConfig;
use crate::error::{CollectorError, CollectorResult};
use crate::fetch::{FetchClient, FetchResource};
use crate::notify::{Milestone, Notifier};
use crate::storage::write_atomic;

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogDocument {
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    archives: Vec<Archive>,
}

/// Known archives in catalog order (newest first).
pub struct ArchiveCatalog {
    path: PathBuf,
    updated_at: Option<DateTime<Utc>>,
    archives: Vec<Archive>,
}

impl ArchiveCatalog {
    /// Restore the persisted catalog. A missing or unreadable file gives an
    /// empty catalog that will be refreshed on first use.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str::<CatalogDocument>(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "malformed archive catalog, ignoring");
                CatalogDocument::default()
            }),
            Err(_) => CatalogDocument::default(),
        };
        Self {
            path,
            updated_at: document.updated_at,
            archives: document.archives,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    pub fn is_stale(&self, now: DateTime<Utc>, refresh_hours: u64) -> bool {
        let window = Duration::hours(refresh_hours.min(1_000_000) as i64);
        match self.updated_at {
            Some(updated_at) => now - updated_at >= window,
            None => true,
        }
    }

    /// Fetch and merge the catalog page unless the last refresh is recent.
    /// Returns the IDs of archives that were not known before.
    pub async fn refresh(
        &mut self,
        fetch: &FetchClient,
        config: &ArchiveConfig,
        notifier: &dyn Notifier,
    ) -> CollectorResult<Vec<String>> {
        self.refresh_at(fetch, config, notifier, Utc::now()).await
    }

    pub async fn refresh_at(
        &mut self,
        fetch: &FetchClient,
        config: &ArchiveConfig,
        notifier: &dyn Notifier,
        now: DateTime<Utc>,
    ) -> CollectorResult<Vec<String>> {
        if !self.is_stale(now, config.catalog_refresh_hours) {
            return Ok(Vec::new());
        }

        let page = fetch
            .read(&FetchResource::new(config.catalog_url()).raw())
            .await?;
        let listed = parse_catalog(&String::from_utf8_lossy(&page))?;
        if listed.is_empty() {
            return Err(CollectorError::parsing("catalog page lists no archives"));
        }

        let first_population = self.archives.is_empty();
        let added = self.merge(listed);
        if first_population {
            tracing::info!(archives = added.len(), "archive catalog populated");
        } else {
            for archive_id in &added {
                tracing::info!(archive = %archive_id, "new archive");
                notifier.notify(Milestone::NewArchive {
                    archive_id: archive_id.clone(),
                });
            }
        }

        self.updated_at = Some(now);
        self.persist()?;
        Ok(added)
    }

    /// Replace the list with the page's order. Archives that vanished from
    /// the page are kept at the end; resolved index locations are carried
    /// over.
    fn merge(&mut self, listed: Vec<(String, String)>) -> Vec<String> {
        let mut previous = std::mem::take(&mut self.archives);
        let mut added = Vec::new();

        for (archive_id, index_paths) in listed {
            if self.archives.iter().any(|a| a.archive_id == archive_id) {
                continue;
            }
            let mut archive = Archive::new(archive_id.clone(), index_paths, self.archives.len());
            match previous.iter().position(|a| a.archive_id == archive_id) {
                Some(i) => archive.adopt_locations(&previous.remove(i)),
                None => added.push(archive_id),
            }
            self.archives.push(archive);
        }
        for mut archive in previous {
            archive.ordinal = self.archives.len();
            self.archives.push(archive);
        }
        added
    }

    fn persist(&self) -> CollectorResult<()> {
        let document = CatalogDocument {
            updated_at: self.updated_at,
            archives: self.archives.clone(),
        };
        write_atomic(&self.path, &serde_json::to_vec_pretty(&document)?)?;
        Ok(())
    }

    pub fn archives(&self) -> &[Archive] {
        &self.archives
    }

    pub fn archives_mut(&mut self) -> &mut [Archive] {
        &mut self.archives
    }

    pub fn get(&self, archive_id: &str) -> Option<&Archive> {
        self.archives.iter().find(|a| a.archive_id == archive_id)
    }

    pub fn get_mut(&mut self, archive_id: &str) -> Option<&mut Archive> {
        self.archives.iter_mut().find(|a| a.archive_id == archive_id)
    }

    pub fn len(&self) -> usize {
        self.archives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives.is_empty()
    }
}

/// Extract `(archiveID, manifest href)` pairs from the catalog page.
///
/// The page is HTML, not XML, so end-tag checking is off and unknown
/// entities fall back to the raw text.
pub fn parse_catalog(html: &str) -> CollectorResult<Vec<(String, String)>> {
    let mut reader = quick_xml::Reader::from_str(html);
    let config = reader.config_mut();
    config.trim_text(true);
    config.check_end_names = false;
    config.allow_unmatched_ends = true;

    let mut found = Vec::new();
    let mut in_body = false;
    let mut link = 0;
    let mut archive_id: Option<String> = None;
    let mut index_paths: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"tbody" => in_body = true,
                b"a" if in_body => {
                    link += 1;
                    if link == 3 {
                        index_paths = href(&e);
                    }
                }
                _ => {}
            },
            Ok(Event::Text(t)) if in_body && link == 1 && archive_id.is_none() => {
                archive_id = Some(text(&t));
            }
            Ok(Event::End(e)) => match e.local_name().as_ref() {
                b"a" if link == 3 => {
                    match (archive_id.take(), index_paths.take()) {
                        (Some(id), Some(paths)) if !id.is_empty() => {
                            tracing::debug!(archive = %id, index_paths = %paths, "parsed catalog row");
                            found.push((id, paths));
                        }
                        _ => tracing::warn!("catalog row without archive ID or manifest link"),
                    }
                    link = 0;
                }
                b"tbody" => break,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(CollectorError::parsing(format!(
                    "catalog page at byte {}: {e}",
                    reader.buffer_position()
                )))
            }
            _ => {}
        }
    }
    Ok(found)
}

fn href(tag: &BytesStart) -> Option<String> {
    tag.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == b"href")
        .map(|a| match a.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&a.value).into_owned(),
        })
}

fn text(t: &BytesText) -> String {
    match t.unescape() {
        Ok(value) => value.trim().to_string(),
        Err(_) => String::from_utf8_lossy(t).trim().to_string(),
    }
}
