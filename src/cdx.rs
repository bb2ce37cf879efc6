//! CDX index wire formats.
//!
//! Two line-oriented formats are read, both sorted by search key:
//!
//! ```text
//! cluster index:  <searchKey> <timestamp>\t<shardFilename>\t<offset>\t<length>\t<cluster>
//! shard index:    <searchKey> <timestamp> <jsonRecord>
//! ```
//!
//! Each cluster-index line describes one compressed block of a shard file.
//! The JSON record of a shard line points at the capture itself inside a
//! WARC/ARC file.

use serde::{Deserialize, Deserializer};

use crate::error::{CollectorError, CollectorResult};

/// One block of the shard index, as listed in an archive's `cluster.idx`.
///
/// Field order matches the natural ordering of the index (search key first).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ClusterIndexEntry {
    pub search_key: String,
    pub timestamp: u64,
    pub shard_filename: String,
    pub offset: u64,
    pub length: u64,
    pub cluster: u64,
}

impl ClusterIndexEntry {
    pub fn parse(line: &str) -> CollectorResult<Self> {
        let malformed = || CollectorError::parsing(format!("malformed cluster index line: {line:?}"));

        let (search_key, rest) = line.split_once(' ').ok_or_else(malformed)?;
        let fields: Vec<&str> = rest.split('\t').collect();
        if fields.len() != 5 {
            return Err(malformed());
        }
        let number = |s: &str| s.trim().parse::<u64>().map_err(|_| malformed());

        Ok(Self {
            search_key: search_key.to_string(),
            timestamp: number(fields[0])?,
            shard_filename: fields[1].to_string(),
            offset: number(fields[2])?,
            length: number(fields[3])?,
            cluster: number(fields[4])?,
        })
    }
}

/// One capture line of a shard index block.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct ShardIndexEntry {
    pub search_key: String,
    pub timestamp: u64,
    pub record_json: String,
}

impl ShardIndexEntry {
    pub fn parse(line: &str) -> CollectorResult<Self> {
        let malformed = || CollectorError::parsing(format!("malformed shard index line: {line:?}"));

        let mut parts = line.splitn(3, ' ');
        let search_key = parts.next().ok_or_else(malformed)?;
        let timestamp = parts
            .next()
            .and_then(|t| t.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let record_json = parts.next().ok_or_else(malformed)?;

        Ok(Self {
            search_key: search_key.to_string(),
            timestamp,
            record_json: record_json.to_string(),
        })
    }
}

/// Parse every non-empty line of a decompressed index with `parse`.
pub fn parse_lines<T>(
    text: &str,
    parse: impl Fn(&str) -> CollectorResult<T>,
) -> CollectorResult<Vec<T>> {
    text.lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.is_empty())
        .map(parse)
        .collect()
}

/// The pointer metadata carried by a shard index record.
///
/// The index publishes `offset` and `length` as JSON strings; plain numbers
/// are accepted too.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CdxRecord {
    #[serde(default)]
    pub url: Option<String>,
    pub filename: String,
    #[serde(deserialize_with = "lenient_u64")]
    pub offset: u64,
    #[serde(deserialize_with = "lenient_u64")]
    pub length: u64,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

impl CdxRecord {
    pub fn from_json(json: &str) -> CollectorResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| CollectorError::parsing(format!("bad index record {json:?}: {e}")))
    }

    /// Local file name for the captured bytes of this record.
    ///
    /// The byte range is embedded before the container extension, so two
    /// records from the same WARC file never collide:
    /// `crawl-data/.../CC-MAIN-x-00001.warc.gz` at 100+50 becomes
    /// `CC-MAIN-x-00001-100-50.warc.gz`.
    pub fn artifact_name(&self) -> String {
        let base = self
            .filename
            .rsplit('/')
            .next()
            .unwrap_or(&self.filename);
        let (stem, ext) = [".warc.gz", ".arc.gz"]
            .iter()
            .find_map(|ext| base.strip_suffix(ext).map(|stem| (stem, *ext)))
            .unwrap_or((base, ""));
        format!("{}-{}-{}{}", stem, self.offset, self.length, ext)
    }
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
