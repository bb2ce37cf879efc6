//! Remote object access with caching, pacing, and failure classification.
//!
//! Everything the collector reads from the archive host goes through
//! [`FetchClient`]: the catalog page, index-path manifests, cluster indexes,
//! shard index blocks, and finally the WARC/ARC records themselves.
//!
//! # Caching
//!
//! A [`FetchResource`] with a `local_path` is cached on disk. Before a cached
//! copy is trusted its size is checked against the expected length (the
//! requested range, or `Content-Length` from a HEAD probe for whole objects).
//! A mismatch, typically a download cut short by a crash, deletes the file
//! and re-fetches it.
//!
//! # Status classification
//!
//! | Outcome | Error |
//! |---------|-------|
//! | 200, 206 | none |
//! | 400–499 | [`CollectorError::UnexpectedStatus`] |
//! | anything else, network errors | [`CollectorError::TransientFetch`] |
//!
//! Every failed request backs off through the [`RequestPacer`] before the
//! error is returned.

use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use flate2::read::MultiGzDecoder;

use crate::config::FetchConfig;
use crate::domain::DomainKey;
use crate::error::{CollectorError, CollectorResult};
use crate::pacer::RequestPacer;
use crate::storage::write_atomic;

/// A byte span `[offset, offset + length)` of a remote object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: u64,
}

impl ByteRange {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    /// Value for the HTTP `Range` header (inclusive end).
    pub fn header_value(&self) -> String {
        format!(
            "bytes={}-{}",
            self.offset,
            self.offset.saturating_add(self.length.saturating_sub(1))
        )
    }
}

/// Something to fetch, and where (if anywhere) to keep it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResource {
    pub url: String,
    /// Local cache/output file. `None` means never touch the disk.
    pub local_path: Option<PathBuf>,
    pub range: Option<ByteRange>,
    /// The domain a record download belongs to, for ledger bookkeeping.
    pub domain: Option<DomainKey>,
    pub archive_id: Option<String>,
    /// Return the body exactly as served, without gzip decoding.
    pub raw: bool,
}

impl FetchResource {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            local_path: None,
            range: None,
            domain: None,
            archive_id: None,
            raw: false,
        }
    }

    pub fn cached_at(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    /// Restrict to a byte range. Both parts are needed for a ranged request.
    pub fn with_range(mut self, offset: Option<u64>, length: Option<u64>) -> Self {
        self.range = match (offset, length) {
            (Some(offset), Some(length)) => Some(ByteRange::new(offset, length)),
            _ => None,
        };
        self
    }

    pub fn for_domain(mut self, domain: DomainKey, archive_id: impl Into<String>) -> Self {
        self.domain = Some(domain);
        self.archive_id = Some(archive_id.into());
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }
}

/// Status and body of one HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The wire. [`HttpTransport`] in production, in-memory fakes in tests.
///
/// Implementations report connection-level failures as
/// [`CollectorError::TransientFetch`] and return every HTTP status as a
/// response; classification happens in [`FetchClient`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str, range: Option<ByteRange>) -> CollectorResult<HttpResponse>;

    /// Returns `(status, Content-Length)` of a HEAD request.
    async fn head(&self, url: &str) -> CollectorResult<(u16, Option<u64>)>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> CollectorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| CollectorError::transient("<client>", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &str, range: Option<ByteRange>) -> CollectorResult<HttpResponse> {
        let mut request = self.client.get(url);
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }
        let resp = request
            .send()
            .await
            .map_err(|e| CollectorError::transient(url, e))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| CollectorError::transient(url, e))?;
        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }

    async fn head(&self, url: &str) -> CollectorResult<(u16, Option<u64>)> {
        let resp = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| CollectorError::transient(url, e))?;
        let length = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        Ok((resp.status().as_u16(), length))
    }
}

/// Map a non-success status to the error taxonomy.
pub fn classify_status(url: &str, status: u16) -> CollectorResult<()> {
    match status {
        200 | 206 => Ok(()),
        400..=499 => Err(CollectorError::UnexpectedStatus {
            url: url.to_string(),
            status,
        }),
        other => Err(CollectorError::transient(url, format!("HTTP {other}"))),
    }
}

/// Rate-limited, backing-off, caching reader/writer of remote objects.
pub struct FetchClient {
    transport: Arc<dyn Transport>,
    pacer: RequestPacer,
}

impl FetchClient {
    pub fn new(transport: Arc<dyn Transport>, pacer: RequestPacer) -> Self {
        Self { transport, pacer }
    }

    pub fn pacer(&self) -> &RequestPacer {
        &self.pacer
    }

    /// Read a resource, from the validated cache if possible, decoding gzip
    /// unless the resource is `raw`.
    pub async fn read(&self, resource: &FetchResource) -> CollectorResult<Vec<u8>> {
        let contents = match &resource.local_path {
            Some(path) if self.has_valid_copy(resource).await? => fs::read(path)?,
            _ => {
                let contents = self.get(resource).await?;
                if let Some(path) = &resource.local_path {
                    if let Err(e) = write_atomic(path, &contents) {
                        tracing::warn!(path = %path.display(), error = %e, "could not write cache file");
                    }
                }
                contents
            }
        };

        if resource.raw {
            Ok(contents)
        } else {
            decompress(&resource.url, contents)
        }
    }

    /// Download a resource to its `local_path`.
    ///
    /// A complete local copy short-circuits without any request, so calling
    /// this again after a crash resumes instead of repeating finished work.
    pub async fn fetch_to_file(&self, resource: &FetchResource) -> CollectorResult<PathBuf> {
        let path = resource.local_path.clone().ok_or_else(|| {
            CollectorError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("no local path set for {}", resource.url),
            ))
        })?;

        if self.has_valid_copy(resource).await? {
            tracing::debug!(path = %path.display(), "already downloaded");
            return Ok(path);
        }

        let contents = self.get(resource).await?;
        write_atomic(&path, &contents)?;
        Ok(path)
    }

    /// One paced GET, honouring the resource's range.
    pub async fn get(&self, resource: &FetchResource) -> CollectorResult<Vec<u8>> {
        let turn = self.pacer.wait_turn().await;
        tracing::debug!(url = %resource.url, range = ?resource.range, "GET");

        let outcome = self
            .transport
            .get(&resource.url, resource.range)
            .await
            .and_then(|resp| classify_status(&resource.url, resp.status).map(|()| resp.body));

        match outcome {
            Ok(body) => {
                turn.record_success();
                Ok(body)
            }
            Err(e) => {
                turn.record_failure().await;
                Err(e)
            }
        }
    }

    /// Expected size of the resource: its range length, or a HEAD probe.
    async fn expected_length(&self, resource: &FetchResource) -> CollectorResult<Option<u64>> {
        if let Some(range) = resource.range {
            return Ok(Some(range.length));
        }

        let turn = self.pacer.wait_turn().await;
        let outcome = self.transport.head(&resource.url).await.and_then(|(status, len)| {
            classify_status(&resource.url, status).map(|()| len)
        });
        match outcome {
            Ok(len) => {
                turn.record_success();
                Ok(len)
            }
            Err(e) => {
                turn.record_failure().await;
                Err(e)
            }
        }
    }

    /// Whether the local copy exists with the expected size. Only file
    /// metadata is inspected; an invalid copy is discarded.
    async fn has_valid_copy(&self, resource: &FetchResource) -> CollectorResult<bool> {
        let Some(path) = &resource.local_path else {
            return Ok(false);
        };
        let Ok(metadata) = fs::metadata(path) else {
            return Ok(false);
        };
        if !metadata.is_file() {
            return Ok(false);
        }

        let expected = self.expected_length(resource).await?;
        match expected {
            Some(expected) if expected != metadata.len() => {
                tracing::warn!(
                    path = %path.display(),
                    expected,
                    actual = metadata.len(),
                    "cached file has the wrong size, fetching again"
                );
                fs::remove_file(path)?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

/// Decode gzip data (one or more concatenated members). Data without the
/// gzip magic header is returned unchanged; the archive publishes some index
/// files uncompressed.
pub fn decompress(url: &str, contents: Vec<u8>) -> CollectorResult<Vec<u8>> {
    if !contents.starts_with(&[0x1f, 0x8b]) {
        return Ok(contents);
    }
    let mut decoded = Vec::with_capacity(contents.len() * 4);
    MultiGzDecoder::new(contents.as_slice())
        .read_to_end(&mut decoded)
        .map_err(|e| CollectorError::parsing(format!("corrupt gzip data from {url}: {e}")))?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pacer::{ManualClock, PacerSettings};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ScriptedTransport {
        bodies: HashMap<String, Vec<u8>>,
        statuses: Mutex<Vec<u16>>,
        requests: Mutex<Vec<(String, Option<ByteRange>)>>,
        heads: Mutex<usize>,
    }

    impl ScriptedTransport {
        fn with(url: &str, body: &[u8]) -> Self {
            let mut t = Self::default();
            t.bodies.insert(url.to_string(), body.to_vec());
            t
        }

        fn requests(&self) -> Vec<(String, Option<ByteRange>)> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn get(&self, url: &str, range: Option<ByteRange>) -> CollectorResult<HttpResponse> {
            self.requests.lock().unwrap().push((url.to_string(), range));
            let scripted = self.statuses.lock().unwrap().pop();
            let body = self.bodies.get(url).cloned().unwrap_or_default();
            let status = scripted.unwrap_or(if self.bodies.contains_key(url) { 200 } else { 404 });
            let body = match range {
                Some(r) if status == 200 || status == 206 => {
                    body[r.offset as usize..(r.offset + r.length) as usize].to_vec()
                }
                _ => body,
            };
            Ok(HttpResponse { status, body })
        }

        async fn head(&self, url: &str) -> CollectorResult<(u16, Option<u64>)> {
            *self.heads.lock().unwrap() += 1;
            match self.bodies.get(url) {
                Some(body) => Ok((200, Some(body.len() as u64))),
                None => Ok((404, None)),
            }
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> (FetchClient, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let pacer = RequestPacer::new(
            PacerSettings {
                min_interval: Duration::from_millis(100),
                backoff_base: Duration::from_secs(1),
                backoff_max: Duration::from_secs(60),
            },
            clock.clone(),
        );
        (FetchClient::new(transport, pacer), clock)
    }

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(data).unwrap();
        enc.finish().unwrap()
    }

    #[test]
    fn test_range_header_is_inclusive() {
        assert_eq!(ByteRange::new(100, 50).header_value(), "bytes=100-149");
    }

    #[test]
    fn test_range_header_saturates_on_huge_values() {
        assert_eq!(
            ByteRange::new(u64::MAX - 1, 10).header_value(),
            format!("bytes={}-{}", u64::MAX - 1, u64::MAX)
        );
        assert_eq!(ByteRange::new(7, 0).header_value(), "bytes=7-7");
    }

    #[test]
    fn test_range_needs_offset_and_length() {
        assert!(FetchResource::new("u").with_range(Some(1), None).range.is_none());
        assert!(FetchResource::new("u").with_range(None, Some(1)).range.is_none());
        assert_eq!(
            FetchResource::new("u").with_range(Some(0), Some(5)).range,
            Some(ByteRange::new(0, 5))
        );
    }

    #[test]
    fn test_classify_status() {
        assert!(classify_status("u", 200).is_ok());
        assert!(classify_status("u", 206).is_ok());
        assert!(matches!(
            classify_status("u", 416),
            Err(CollectorError::UnexpectedStatus { status: 416, .. })
        ));
        assert!(classify_status("u", 503).unwrap_err().is_retryable());
        assert!(classify_status("u", 304).unwrap_err().is_retryable());
    }

    #[test]
    fn test_decompress_passes_plain_text_through() {
        assert_eq!(decompress("u", b"plain".to_vec()).unwrap(), b"plain");
        let mut two_members = gzip(b"first\n");
        two_members.extend(gzip(b"second\n"));
        assert_eq!(decompress("u", two_members).unwrap(), b"first\nsecond\n");
    }

    #[tokio::test]
    async fn test_read_caches_and_validates_size() {
        let tmp = TempDir::new().unwrap();
        let body = gzip(b"hello index");
        let transport = Arc::new(ScriptedTransport::with("https://h/idx.gz", &body));
        let (client, _) = client(transport.clone());
        let cache = tmp.path().join("idx.gz");
        let res = FetchResource::new("https://h/idx.gz").cached_at(&cache);

        assert_eq!(client.read(&res).await.unwrap(), b"hello index");
        assert_eq!(fs::read(&cache).unwrap(), body);

        // Valid cache: one HEAD probe, no second GET.
        assert_eq!(client.read(&res).await.unwrap(), b"hello index");
        assert_eq!(transport.requests().len(), 1);
        assert_eq!(*transport.heads.lock().unwrap(), 1);

        // Truncated cache is discarded and fetched again.
        fs::write(&cache, &body[..3]).unwrap();
        assert_eq!(client.read(&res).await.unwrap(), b"hello index");
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_to_file_is_resumable() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with("https://h/w.warc.gz", b"0123456789"));
        let (client, _) = client(transport.clone());
        let out = tmp.path().join("out/w-2-4.warc.gz");
        let res = FetchResource::new("https://h/w.warc.gz")
            .cached_at(&out)
            .with_range(Some(2), Some(4));

        client.fetch_to_file(&res).await.unwrap();
        assert_eq!(fs::read(&out).unwrap(), b"2345");
        client.fetch_to_file(&res).await.unwrap();
        assert_eq!(
            transport.requests(),
            vec![("https://h/w.warc.gz".to_string(), Some(ByteRange::new(2, 4)))]
        );
    }

    #[tokio::test]
    async fn test_fetch_to_file_checks_only_the_size_of_an_existing_copy() {
        let tmp = TempDir::new().unwrap();
        let transport = Arc::new(ScriptedTransport::with("https://h/w.warc.gz", b"0123456789"));
        let (client, _) = client(transport.clone());
        let out = tmp.path().join("w-0-4.warc.gz");
        fs::write(&out, b"done").unwrap();
        let res = FetchResource::new("https://h/w.warc.gz")
            .cached_at(&out)
            .with_range(Some(0), Some(4));

        assert_eq!(client.fetch_to_file(&res).await.unwrap(), out);
        assert!(transport.requests().is_empty());
        assert_eq!(*transport.heads.lock().unwrap(), 0);
        assert_eq!(fs::read(&out).unwrap(), b"done");

        // A directory in the way is not a finished download.
        let blocked = tmp.path().join("w-4-2.warc.gz");
        fs::create_dir(&blocked).unwrap();
        let res = FetchResource::new("https://h/w.warc.gz")
            .cached_at(&blocked)
            .with_range(Some(4), Some(2));
        assert!(client.fetch_to_file(&res).await.is_err());
        assert_eq!(transport.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_failure_backs_off_and_classifies() {
        let transport = Arc::new(ScriptedTransport::with("https://h/x", b"x"));
        transport.statuses.lock().unwrap().extend([503, 500]);
        let (client, clock) = client(transport.clone());
        let res = FetchResource::new("https://h/x").raw();

        let err = client.read(&res).await.unwrap_err();
        assert!(err.is_retryable());
        let err = client.read(&res).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs_f64(1.5), Duration::from_secs_f64(2.25)]
        );
        assert_eq!(client.read(&res).await.unwrap(), b"x");
        assert_eq!(client.pacer().consecutive_failures().await, 0);

        let missing = FetchResource::new("https://h/missing").raw();
        assert!(matches!(
            client.read(&missing).await,
            Err(CollectorError::UnexpectedStatus { status: 404, .. })
        ));
    }
}
