//! One crawl snapshot and the locations of its index.
//!
//! The catalog only tells us where an archive's `cc-index.paths.gz` manifest
//! lives. The manifest lists every index file of the snapshot, one relative
//! path per line; the line ending in `cluster.idx` gives both the cluster
//! index and the directory holding the shard files. This is resolved once,
//! on first use, and never changes afterwards.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ArchiveConfig;
use crate::error::{CollectorError, CollectorResult};
use crate::fetch::{FetchClient, FetchResource};

const CLUSTER_INDEX: &str = "cluster.idx";

/// Where an archive's index files live, as read from its manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexLocations {
    pub cluster_index_url: String,
    /// Prefix that turns a shard filename from the cluster index into a URL.
    pub shard_prefix: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Archive {
    pub archive_id: String,
    /// Manifest location as published by the catalog (absolute or host-relative).
    pub index_paths: String,
    /// Position in the catalog, newest first.
    #[serde(default)]
    pub ordinal: usize,
    #[serde(skip)]
    locations: Option<IndexLocations>,
}

impl Archive {
    pub fn new(archive_id: impl Into<String>, index_paths: impl Into<String>, ordinal: usize) -> Self {
        Self {
            archive_id: archive_id.into(),
            index_paths: index_paths.into(),
            ordinal,
            locations: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.locations.is_some()
    }

    /// Local directory for everything cached about this archive.
    pub fn cache_dir(&self, cache_root: &Path) -> PathBuf {
        cache_root.join(&self.archive_id)
    }

    /// Read the manifest (cached under the archive's cache directory) and
    /// find the cluster index. A manifest without a `cluster.idx` line is a
    /// parsing failure.
    pub async fn resolve(
        &mut self,
        fetch: &FetchClient,
        config: &ArchiveConfig,
        cache_root: &Path,
    ) -> CollectorResult<&IndexLocations> {
        if self.locations.is_none() {
            let manifest = FetchResource::new(config.url_for(&self.index_paths))
                .cached_at(self.cache_dir(cache_root).join("cc-index.paths.gz"));
            let contents = fetch.read(&manifest).await?;
            let text = String::from_utf8_lossy(&contents);
            let locations = locations_from_manifest(&text, config).ok_or_else(|| {
                CollectorError::parsing(format!(
                    "manifest of {} names no {CLUSTER_INDEX}",
                    self.archive_id
                ))
            })?;
            tracing::debug!(
                archive = %self.archive_id,
                cluster_index = %locations.cluster_index_url,
                "resolved index locations"
            );
            self.locations = Some(locations);
        }
        self.locations()
    }

    pub fn locations(&self) -> CollectorResult<&IndexLocations> {
        self.locations.as_ref().ok_or_else(|| {
            CollectorError::parsing(format!("archive {} has not been resolved", self.archive_id))
        })
    }

    /// The cluster index, cached permanently next to the manifest.
    pub fn cluster_index_resource(&self, cache_root: &Path) -> CollectorResult<FetchResource> {
        Ok(FetchResource::new(self.locations()?.cluster_index_url.clone())
            .cached_at(self.cache_dir(cache_root).join(CLUSTER_INDEX)))
    }

    pub fn shard_url(&self, shard_filename: &str) -> CollectorResult<String> {
        Ok(format!("{}{}", self.locations()?.shard_prefix, shard_filename))
    }

    /// Carry already-resolved locations over from an older copy.
    pub(crate) fn adopt_locations(&mut self, other: &Archive) {
        if self.locations.is_none() && self.index_paths == other.index_paths {
            self.locations = other.locations.clone();
        }
    }
}

fn locations_from_manifest(manifest: &str, config: &ArchiveConfig) -> Option<IndexLocations> {
    let line = manifest
        .lines()
        .map(str::trim)
        .find(|line| line.ends_with(CLUSTER_INDEX))?;
    let prefix = line.strip_suffix(CLUSTER_INDEX)?;
    Some(IndexLocations {
        cluster_index_url: config.url_for(line),
        shard_prefix: config.url_for(prefix),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locations_from_manifest() {
        let config = ArchiveConfig::default();
        let manifest = "cc-index/collections/CC-MAIN-2024-10/indexes/cdx-00000.gz\n\
                        cc-index/collections/CC-MAIN-2024-10/indexes/cdx-00001.gz\n\
                        cc-index/collections/CC-MAIN-2024-10/indexes/cluster.idx\n";
        let loc = locations_from_manifest(manifest, &config).unwrap();
        assert_eq!(
            loc.cluster_index_url,
            "https://data.commoncrawl.org/cc-index/collections/CC-MAIN-2024-10/indexes/cluster.idx"
        );
        assert_eq!(
            loc.shard_prefix,
            "https://data.commoncrawl.org/cc-index/collections/CC-MAIN-2024-10/indexes/"
        );
    }

    #[test]
    fn test_manifest_without_cluster_index() {
        let config = ArchiveConfig::default();
        assert!(locations_from_manifest("a/cdx-00000.gz\n", &config).is_none());
    }

    #[test]
    fn test_unresolved_archive_has_no_urls() {
        let archive = Archive::new("CC-MAIN-2024-10", "x/cc-index.paths.gz", 0);
        assert!(!archive.is_resolved());
        assert!(archive.shard_url("cdx-00000.gz").is_err());
        assert_eq!(
            archive.cache_dir(Path::new(".cache")),
            PathBuf::from(".cache/CC-MAIN-2024-10")
        );
    }
}
