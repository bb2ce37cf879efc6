//! Two-stage binary search over an archive's remote index.
//!
//! An archive's CDX index is split in two levels:
//!
//! 1. `cluster.idx`, small enough to download whole: one line per compressed
//!    block of the shard files, keyed by the first search key in that block.
//! 2. The shard files (`cdx-NNNNN.gz`), hundreds of gigabytes in total, read
//!    one block at a time with HTTP range requests.
//!
//! Search keys are sorted, so all captures of a domain and its subdomains
//! sit in one contiguous run (see [`crate::domain`]). Stage one finds the
//! blocks that may hold that run; stage two reads only those blocks.
//!
//! # Boundary block
//!
//! A block's key is its *first* entry. The block just before the lower-bound
//! insertion point starts before the domain but may end inside it, so it is
//! always included. When the insertion point is 0 there is no such block.

use std::path::PathBuf;

use crate::archive::Archive;
use crate::cdx::{parse_lines, ClusterIndexEntry, ShardIndexEntry};
use crate::config::ArchiveConfig;
use crate::domain::DomainKey;
use crate::error::CollectorResult;
use crate::fetch::{FetchClient, FetchResource};
use crate::progress::{ProgressField, ProgressStore};

/// Index search session. Keeps the most recently used cluster index in
/// memory; switching archives replaces it.
pub struct IndexSearch {
    cache_root: PathBuf,
    cache_blocks: bool,
    loaded: Option<(String, Vec<ClusterIndexEntry>)>,
}

impl IndexSearch {
    pub fn new(cache_root: impl Into<PathBuf>, cache_blocks: bool) -> Self {
        Self {
            cache_root: cache_root.into(),
            cache_blocks,
            loaded: None,
        }
    }

    /// Find every matching record of `key` in `archive`, recording the
    /// result count in `progress`.
    pub async fn search(
        &mut self,
        fetch: &FetchClient,
        progress: &mut ProgressStore,
        key: &DomainKey,
        archive: &mut Archive,
        config: &ArchiveConfig,
    ) -> CollectorResult<Vec<String>> {
        let clusters = self.locate_clusters(fetch, key, archive, config).await?;
        let records = self
            .locate_records(fetch, progress, key, archive, &clusters)
            .await?;
        tracing::info!(
            domain = %key,
            archive = %archive.archive_id,
            blocks = clusters.len(),
            results = records.len(),
            "search finished"
        );
        Ok(records)
    }

    /// Stage one: the shard blocks that can contain `key`.
    pub async fn locate_clusters(
        &mut self,
        fetch: &FetchClient,
        key: &DomainKey,
        archive: &mut Archive,
        config: &ArchiveConfig,
    ) -> CollectorResult<Vec<ClusterIndexEntry>> {
        let index = self.cluster_index(fetch, archive, config).await?;
        Ok(select_clusters(index, key))
    }

    async fn cluster_index(
        &mut self,
        fetch: &FetchClient,
        archive: &mut Archive,
        config: &ArchiveConfig,
    ) -> CollectorResult<&[ClusterIndexEntry]> {
        let current = matches!(&self.loaded, Some((id, _)) if *id == archive.archive_id);
        if !current {
            archive.resolve(fetch, config, &self.cache_root).await?;
            let resource = archive.cluster_index_resource(&self.cache_root)?;
            let contents = fetch.read(&resource).await?;
            let entries = parse_lines(&String::from_utf8_lossy(&contents), ClusterIndexEntry::parse)?;
            tracing::debug!(archive = %archive.archive_id, blocks = entries.len(), "loaded cluster index");
            self.loaded = Some((archive.archive_id.clone(), entries));
        }
        Ok(self
            .loaded
            .as_ref()
            .map(|(_, entries)| entries.as_slice())
            .unwrap_or_default())
    }

    /// Stage two: read each block and collect the JSON payload of every
    /// matching line, in index order.
    ///
    /// Sets `results` for the pair; an empty result also sets `completed`
    /// to 0 so the pair counts as done.
    pub async fn locate_records(
        &self,
        fetch: &FetchClient,
        progress: &mut ProgressStore,
        key: &DomainKey,
        archive: &Archive,
        clusters: &[ClusterIndexEntry],
    ) -> CollectorResult<Vec<String>> {
        let mut records = Vec::new();
        for (i, cluster) in clusters.iter().enumerate() {
            let contents = fetch.read(&self.block_resource(archive, cluster)?).await?;
            let block = parse_lines(&String::from_utf8_lossy(&contents), ShardIndexEntry::parse)?;
            records.extend(scan_block(&block, key, i == 0));
        }

        let domain = key.domain();
        let archive_id = &archive.archive_id;
        progress.record_result(domain, archive_id, ProgressField::Results, records.len() as u64)?;
        if records.is_empty() {
            progress.record_result(domain, archive_id, ProgressField::Completed, 0)?;
        }
        Ok(records)
    }

    fn block_resource(
        &self,
        archive: &Archive,
        cluster: &ClusterIndexEntry,
    ) -> CollectorResult<FetchResource> {
        let resource = FetchResource::new(archive.shard_url(&cluster.shard_filename)?)
            .with_range(Some(cluster.offset), Some(cluster.length));
        Ok(if self.cache_blocks {
            resource.cached_at(
                archive
                    .cache_dir(&self.cache_root)
                    .join(format!("{}-{}", cluster.shard_filename, cluster.cluster)),
            )
        } else {
            resource
        })
    }
}

/// Blocks of `index` that may contain entries of `key`: the block before
/// the lower-bound insertion point, then every block whose first key
/// matches.
pub fn select_clusters(index: &[ClusterIndexEntry], key: &DomainKey) -> Vec<ClusterIndexEntry> {
    let bound = key.lower_bound();
    let start = index.partition_point(|e| e.search_key.as_str() < bound.as_str());

    let mut selected = Vec::new();
    if start > 0 {
        selected.push(index[start - 1].clone());
    }
    selected.extend(
        index[start..]
            .iter()
            .take_while(|e| key.matches(&e.search_key))
            .cloned(),
    );
    selected
}

/// Matching payloads of one decoded block. Only the first block needs a
/// lower-bound search; later blocks start inside the run.
pub fn scan_block(block: &[ShardIndexEntry], key: &DomainKey, first: bool) -> Vec<String> {
    let start = if first {
        let bound = key.lower_bound();
        block.partition_point(|e| e.search_key.as_str() < bound.as_str())
    } else {
        0
    };
    block[start..]
        .iter()
        .take_while(|e| key.matches(&e.search_key))
        .map(|e| e.record_json.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(search_key: &str, n: u64) -> ClusterIndexEntry {
        ClusterIndexEntry {
            search_key: search_key.to_string(),
            timestamp: 20240101000000,
            shard_filename: "cdx-00000.gz".to_string(),
            offset: n * 1000,
            length: 1000,
            cluster: n,
        }
    }

    fn shard(search_key: &str) -> ShardIndexEntry {
        ShardIndexEntry {
            search_key: search_key.to_string(),
            timestamp: 20240101000000,
            record_json: format!("{{\"key\": \"{search_key}\"}}"),
        }
    }

    fn keys(selected: &[ClusterIndexEntry]) -> Vec<u64> {
        selected.iter().map(|c| c.cluster).collect()
    }

    #[test]
    fn test_includes_block_before_insertion_point() {
        let key = DomainKey::new("example.com").unwrap();
        let index = vec![
            cluster("com,apple)/", 0),
            cluster("com,cat)/", 1),
            cluster("com,example)/b", 2),
            cluster("com,example,www)/", 3),
            cluster("com,exampleinc)/", 4),
            cluster("org,x)/", 5),
        ];
        // Block 1 may end with com,example)/a; 4 starts past the run.
        assert_eq!(keys(&select_clusters(&index, &key)), vec![1, 2, 3]);
    }

    #[test]
    fn test_run_inside_one_block() {
        let key = DomainKey::new("example.com").unwrap();
        let index = vec![cluster("com,apple)/", 0), cluster("com,fox)/", 1)];
        assert_eq!(keys(&select_clusters(&index, &key)), vec![0]);
    }

    #[test]
    fn test_insertion_point_zero_has_no_preceding_block() {
        let key = DomainKey::new("example.com").unwrap();
        let index = vec![
            cluster("com,example)/", 0),
            cluster("com,example,a)/", 1),
            cluster("com,fox)/", 2),
        ];
        assert_eq!(keys(&select_clusters(&index, &key)), vec![0, 1]);

        let before_everything = DomainKey::new("aaa.aaa").unwrap();
        assert!(select_clusters(&index, &before_everything).is_empty());
    }

    #[test]
    fn test_past_the_end_selects_last_block() {
        let key = DomainKey::new("zzz.zzz").unwrap();
        let index = vec![cluster("com,a)/", 0), cluster("org,b)/", 1)];
        assert_eq!(keys(&select_clusters(&index, &key)), vec![1]);
        assert!(select_clusters(&[], &key).is_empty());
    }

    #[test]
    fn test_scan_first_block_uses_lower_bound() {
        let key = DomainKey::new("example.com").unwrap();
        let block = vec![
            shard("com,cat)/"),
            shard("com,example)/"),
            shard("com,example)/about"),
            shard("com,example,blog)/"),
            shard("com,exampleinc)/"),
            shard("com,example,late)/"),
        ];
        let found = scan_block(&block, &key, true);
        assert_eq!(found.len(), 3);
        assert!(found[0].contains("com,example)/"));
        assert!(found[2].contains("com,example,blog)/"));
    }

    #[test]
    fn test_scan_later_block_stops_at_first_mismatch() {
        let key = DomainKey::new("example.com").unwrap();
        let block = vec![
            shard("com,example,www)/"),
            shard("com,example,www)/x"),
            shard("com,examplf)/"),
        ];
        assert_eq!(scan_block(&block, &key, false).len(), 2);
        assert!(scan_block(&[shard("com,fox)/")], &key, false).is_empty());
    }

    #[test]
    fn test_matches_are_contiguous_in_sorted_keys() {
        let key = DomainKey::new("example.com").unwrap();
        let mut all: Vec<&str> = vec![
            "com,example)/",
            "com,example,a)/",
            "com,example-shop)/",
            "com,exampleinc)/",
            "com,exampl)/",
            "com,example,zz)/q",
            "com,examplf)/",
            "com,example)/z",
        ];
        all.sort();
        let flags: Vec<bool> = all.iter().map(|k| key.matches(k)).collect();
        let first = flags.iter().position(|m| *m).unwrap();
        let last = flags.iter().rposition(|m| *m).unwrap();
        assert!(flags[first..=last].iter().all(|m| *m));
        assert_eq!(last - first + 1, 4);
    }

    #[test]
    fn test_boundary_rows_of_one_shard() {
        let row = |search_key: &str, shard: &str, offset: u64, cluster: u64| ClusterIndexEntry {
            search_key: search_key.to_string(),
            timestamp: 0,
            shard_filename: shard.to_string(),
            offset,
            length: 10,
            cluster,
        };
        let r0 = row("com,example)/", "A", 0, 0);
        let r1 = row("com,example,blog)/", "A", 10, 0);
        let r2 = row("com,exampleinc)/", "B", 0, 1);
        let index = vec![r0.clone(), r1.clone(), r2];

        let key = DomainKey::new("example.com").unwrap();
        assert_eq!(select_clusters(&index, &key), vec![r0, r1]);
    }

    #[test]
    fn test_selection_is_a_contiguous_slice_for_every_key() {
        let mut index: Vec<ClusterIndexEntry> = [
            "at,wien)/",
            "com,apple)/",
            "com,example)/",
            "com,example)/blog",
            "com,example,a)/",
            "com,example,mail)/",
            "com,example,www)/z",
            "com,example-shop)/",
            "com,exampleinc)/",
            "com,examplf)/",
            "net,example)/",
            "org,example)/",
            "org,example,docs)/",
            "se,liu)/",
            "se,liu,www)/",
        ]
        .iter()
        .enumerate()
        .map(|(n, k)| cluster(k, n as u64))
        .collect();
        index.sort_by(|a, b| a.search_key.cmp(&b.search_key));

        for domain in [
            "example.com",
            "www.example.com",
            "example.org",
            "example.net",
            "liu.se",
            "exampleinc.com",
            "apple.com",
            "aaa.aa",
            "zzz.zzz",
            "missing.com",
        ] {
            let key = DomainKey::new(domain).unwrap();
            let selected = select_clusters(&index, &key);
            let Some(first) = selected.first() else {
                continue;
            };
            let start = index.iter().position(|c| c == first).unwrap();
            assert_eq!(
                &index[start..start + selected.len()],
                selected.as_slice(),
                "{domain}"
            );
            assert!(
                selected[1..].iter().all(|c| key.matches(&c.search_key)),
                "{domain}"
            );
        }
    }
}
